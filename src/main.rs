use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use log::{debug, warn};
use std::io;
use std::process;
use thiserror::Error;

use nyulan::bytecode::CURRENT_INSTRUCTION_SET_VERSION;
use nyulan::config::{self, CONFIG};
use nyulan::debuginfo::{DebugInfo, SourceLineTracer};
use nyulan::events::{EventWriter, LogFormat, LogObserver};
use nyulan::objectfile::{FormatError, LookupError, ObjectFile};
use nyulan::vm::{Termination, VMError, VirtualMachine};

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    Load(#[from] FormatError),

    #[error("{0}")]
    Lookup(#[from] LookupError),

    #[error("{0}")]
    Run(#[from] VMError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AppError {
    /// Load failures exit with 1, execution faults with 2.
    fn exit_code(&self) -> i32 {
        match self {
            AppError::Run(_) => 2,
            _ => 1,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            AppError::Load(_) | AppError::Lookup(_) => "failed to load:",
            AppError::Run(_) => "failed to run:",
            _ => "error:",
        }
    }
}

fn cli() -> Command {
    Command::new("nyulan")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Register-based bytecode virtual machine")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log loader and VM activity at debug level")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("run")
                .about("Execute an object file")
                .arg(
                    Arg::new("object")
                        .value_name("OBJECT")
                        .help("Object file to execute")
                        .required(true),
                )
                .arg(
                    Arg::new("entry")
                        .short('e')
                        .long("entry")
                        .value_name("LABEL")
                        .help("Label to start at (default: NYULAN_ENTRY_LABEL or _start)"),
                )
                .arg(
                    Arg::new("trace")
                        .long("trace")
                        .help("Log the source line, or the instruction, of every step")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("events")
                        .long("events")
                        .help("Print every executed step as JSON to stderr while running")
                        .conflicts_with("trace")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("readobj")
                .about("Describe the contents of an object file")
                .arg(
                    Arg::new("object")
                        .value_name("OBJECT")
                        .help("Object file to describe")
                        .required(true),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .help("Print a JSON summary instead of text")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn init_logging(matches: &ArgMatches) {
    let tracing = matches
        .subcommand_matches("run")
        .map(|run| run.get_flag("trace"))
        .unwrap_or(false);
    let filter = if tracing {
        "trace"
    } else if matches.get_flag("verbose") {
        "debug"
    } else {
        CONFIG.log_filter.as_str()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

fn run(matches: &ArgMatches) -> Result<Termination, AppError> {
    let path = matches
        .get_one::<String>("object")
        .map(String::as_str)
        .unwrap_or_default();
    let object = ObjectFile::open(path)?;
    if object.instruction_set_version > CURRENT_INSTRUCTION_SET_VERSION {
        warn!(
            "{} targets instruction set version {}, this VM implements {}",
            path, object.instruction_set_version, CURRENT_INSTRUCTION_SET_VERSION
        );
    }

    let label = matches
        .get_one::<String>("entry")
        .unwrap_or(&CONFIG.entry_label);
    let entry = object.find_label(label)?.address;
    debug!("entry point {} = {}", label, entry);

    let mut vm = VirtualMachine::new(&object.literal_data).with_limits(CONFIG.limits);

    if matches.get_flag("trace") {
        match DebugInfo::load(&object) {
            Ok(info) => vm.install_observer(Box::new(SourceLineTracer::new(info))),
            Err(e) => {
                debug!("no source lines available: {}", e);
                vm.install_observer(Box::new(LogObserver));
            }
        }
    } else if matches.get_flag("events") {
        vm.install_observer(Box::new(EventWriter::new(io::stderr(), LogFormat::Json)));
    }

    Ok(vm.execute(&object.code, entry)?)
}

fn readobj(matches: &ArgMatches) -> Result<(), AppError> {
    let path = matches
        .get_one::<String>("object")
        .map(String::as_str)
        .unwrap_or_default();
    let object = ObjectFile::open(path)?;
    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&object)?);
    } else {
        print!("{}", object);
    }
    Ok(())
}

fn main() {
    let matches = cli().get_matches();
    config::init();
    init_logging(&matches);

    let result = match matches.subcommand() {
        Some(("run", sub)) => run(sub),
        Some(("readobj", sub)) => readobj(sub).map(|_| Termination::EndOfCode),
        _ => unreachable!("clap requires a subcommand"),
    };

    match result {
        Ok(termination) => {
            let status = termination.status();
            if status != 0 {
                process::exit(status);
            }
        }
        Err(err) => {
            eprintln!("{} {}", err.prefix().red().bold(), err);
            process::exit(err.exit_code());
        }
    }
}

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use log::{trace, warn};

use crate::bytecode::Instruction;
use crate::types::{Address, OneStep};
use crate::vm::Observer;

/// One notification from the execution loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A word is about to execute
    Step {
        address: u64,
        word: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
    },
    /// The program counter moved to `address`
    Jump { address: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl ExecutionEvent {
    pub fn step(address: Address, step: OneStep) -> Self {
        ExecutionEvent::Step {
            address: address.value(),
            word: step.value(),
            instruction: Instruction::decode(step).ok().map(|i| i.to_string()),
        }
    }

    pub fn jump(address: Address) -> Self {
        ExecutionEvent::Jump {
            address: address.value(),
        }
    }

    pub fn emit<W: Write + ?Sized>(&self, out: &mut W, format: LogFormat) -> io::Result<()> {
        match format {
            LogFormat::Pretty => writeln!(out, "{}", self.pretty()),
            LogFormat::Json => {
                let json = serde_json::to_string(self).map_err(io::Error::other)?;
                writeln!(out, "{}", json)
            }
        }
    }

    fn pretty(&self) -> String {
        match self {
            ExecutionEvent::Step {
                address,
                word,
                instruction: Some(instruction),
            } => format!("[step] @{} {:04x} {}", address, word, instruction),
            ExecutionEvent::Step { address, word, .. } => {
                format!("[step] @{} {:04x} ??", address, word)
            }
            ExecutionEvent::Jump { address } => format!("[pc]   @{}", address),
        }
    }
}

/// Observer that records every event in a shared list
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<ExecutionEvent>>>,
    record_jumps: bool,
}

impl EventLog {
    /// Records steps only
    pub fn new() -> Self {
        Self::default()
    }

    /// Records steps and program counter updates
    pub fn with_jumps() -> Self {
        Self {
            events: Rc::default(),
            record_jumps: true,
        }
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

impl Observer for EventLog {
    fn before_step(&mut self, address: Address, step: OneStep) {
        self.events
            .borrow_mut()
            .push(ExecutionEvent::step(address, step));
    }

    fn program_counter_updated(&mut self, address: Address) {
        if self.record_jumps {
            self.events.borrow_mut().push(ExecutionEvent::jump(address));
        }
    }
}

/// Observer that writes every step to `out` as it happens
#[derive(Debug)]
pub struct EventWriter<W: Write> {
    out: W,
    format: LogFormat,
    failed: bool,
}

impl<W: Write> EventWriter<W> {
    pub fn new(out: W, format: LogFormat) -> Self {
        Self {
            out,
            format,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Observer for EventWriter<W> {
    fn before_step(&mut self, address: Address, step: OneStep) {
        if self.failed {
            return;
        }
        // A broken sink must not stop the program; report once and go quiet.
        if let Err(e) = ExecutionEvent::step(address, step).emit(&mut self.out, self.format) {
            warn!("stopped writing execution events: {}", e);
            self.failed = true;
        }
    }
}

/// Observer that forwards every step to the `log` facade at trace level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn before_step(&mut self, address: Address, step: OneStep) {
        match Instruction::decode(step) {
            Ok(instruction) => trace!("{} {}", address, instruction),
            Err(opcode) => trace!("{} ?? opcode {:#04x}", address, opcode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    #[test]
    fn test_event_log_shares_records() {
        let log = EventLog::with_jumps();
        let mut observer = log.clone();
        observer.before_step(Address(0), OneStep::encode(Opcode::Add, 1, 2));
        observer.program_counter_updated(Address(1));
        assert_eq!(
            log.events(),
            vec![
                ExecutionEvent::Step {
                    address: 0,
                    word: 0x0612,
                    instruction: Some("ADD r1,r2".to_string()),
                },
                ExecutionEvent::Jump { address: 1 },
            ]
        );
    }

    #[test]
    fn test_steps_only_by_default() {
        let mut log = EventLog::new();
        log.before_step(Address(3), OneStep(0xFF00));
        log.program_counter_updated(Address(4));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_writer_streams_each_step() {
        let mut writer = EventWriter::new(Vec::new(), LogFormat::Json);
        writer.before_step(Address(0), OneStep::encode(Opcode::Ret, 0, 0));
        writer.program_counter_updated(Address(1));
        writer.before_step(Address(1), OneStep(0xFF00));
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "{\"event\":\"step\",\"address\":0,\"word\":10240,\"instruction\":\"RET\"}"
        );
    }

    struct BrokenPipe(usize);

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            self.0 += 1;
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_goes_quiet_after_failure() {
        let mut writer = EventWriter::new(BrokenPipe(0), LogFormat::Pretty);
        for i in 0..3 {
            writer.before_step(Address(i), OneStep(0));
        }
        assert_eq!(writer.into_inner().0, 1);
    }

    #[test]
    fn test_json_output() {
        let mut out = Vec::new();
        ExecutionEvent::jump(Address(9))
            .emit(&mut out, LogFormat::Json)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"event\":\"jump\",\"address\":9}\n"
        );
    }

    #[test]
    fn test_pretty_output_of_unknown_word() {
        let mut out = Vec::new();
        ExecutionEvent::step(Address(2), OneStep(0xFF01))
            .emit(&mut out, LogFormat::Pretty)
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[step] @2 ff01 ??\n");
    }
}

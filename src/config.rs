use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::objectfile::ENTRY_LABEL;
use crate::vm::Limits;

/// Runtime settings taken from `NYULAN_*` environment variables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Label execution starts at
    pub entry_label: String,
    pub limits: Limits,
    /// `env_logger` filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_label: ENTRY_LABEL.to_string(),
            limits: Limits::default(),
            log_filter: "warn".to_string(),
        }
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
fn parse_number<T>(raw: &str) -> Option<T>
where
    T: FromStr + TryFrom<u64>,
{
    let raw = raw.trim().replace('_', "");
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| T::try_from(v).ok()),
        None => raw.parse().ok(),
    }
}

impl Config {
    /// Build a configuration from any variable source, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        fn number<T, F>(lookup: &F, key: &str, default: T) -> T
        where
            T: FromStr + TryFrom<u64> + std::fmt::Display,
            F: Fn(&str) -> Option<String>,
        {
            match lookup(key) {
                Some(raw) => parse_number(&raw).unwrap_or_else(|| {
                    warn!("ignoring invalid {}={:?}, using {}", key, raw, default);
                    default
                }),
                None => default,
            }
        }

        Config {
            entry_label: lookup("NYULAN_ENTRY_LABEL")
                .filter(|label| !label.is_empty())
                .unwrap_or(defaults.entry_label),
            limits: Limits {
                max_stack_bytes: number(
                    &lookup,
                    "NYULAN_MAX_STACK_BYTES",
                    defaults.limits.max_stack_bytes,
                ),
                max_call_depth: number(
                    &lookup,
                    "NYULAN_MAX_CALL_DEPTH",
                    defaults.limits.max_call_depth,
                ),
                heap_base: number(&lookup, "NYULAN_HEAP_BASE", defaults.limits.heap_base),
                max_heap_bytes: number(
                    &lookup,
                    "NYULAN_MAX_HEAP_BYTES",
                    defaults.limits.max_heap_bytes,
                ),
            },
            log_filter: lookup("NYULAN_LOG").unwrap_or(defaults.log_filter),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

pub static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

pub fn init() {
    Lazy::force(&CONFIG);
}

// Console log control
// Shared handle for the console log threshold, captured and restored by checkpoints.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Severity threshold for console log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Handle to the console log threshold of the surrounding application.
pub trait LogControl: Send + Sync {
    fn console_level(&self) -> LogLevel;
    fn set_console_level(&self, level: LogLevel);
}

/// In-process log threshold shared between the runner and its checkpoints.
#[derive(Debug, Clone)]
pub struct SharedLogControl {
    level: Arc<RwLock<LogLevel>>,
}

impl SharedLogControl {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level: Arc::new(RwLock::new(level)),
        }
    }
}

impl Default for SharedLogControl {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl LogControl for SharedLogControl {
    fn console_level(&self) -> LogLevel {
        *self.level.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_console_level(&self, level: LogLevel) {
        *self.level.write().unwrap_or_else(PoisonError::into_inner) = level;
    }
}

// Preference store
// Key-value runtime preferences with snapshot and restore support.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

/// Preference keys used by the phase sequencer.
pub mod keys {
    /// Code generation target for full model objects.
    pub const CODEGEN_TARGET: &str = "codegen.target";
    /// Code generation target for one-off string expressions.
    pub const STRING_EXPRESSION_TARGET: &str = "codegen.string_expression_target";
    /// Default floating point width for state variables.
    pub const FLOAT_PRECISION: &str = "core.float_precision";
    /// Extra flags passed to the C compiler.
    pub const CC_EXTRA_FLAGS: &str = "codegen.cc.extra_flags";
    /// OpenMP thread count for the standalone device, zero disables OpenMP.
    pub const OPENMP_THREADS: &str = "devices.c-standalone.openmp_threads";
}

/// A single preference value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for PrefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefValue::Bool(value) => write!(f, "{}", value),
            PrefValue::Int(value) => write!(f, "{}", value),
            PrefValue::Float(value) => write!(f, "{}", value),
            PrefValue::Str(value) => write!(f, "{}", value),
        }
    }
}

impl From<bool> for PrefValue {
    fn from(value: bool) -> Self {
        PrefValue::Bool(value)
    }
}

impl From<i64> for PrefValue {
    fn from(value: i64) -> Self {
        PrefValue::Int(value)
    }
}

impl From<f64> for PrefValue {
    fn from(value: f64) -> Self {
        PrefValue::Float(value)
    }
}

impl From<&str> for PrefValue {
    fn from(value: &str) -> Self {
        PrefValue::Str(value.to_string())
    }
}

impl From<String> for PrefValue {
    fn from(value: String) -> Self {
        PrefValue::Str(value)
    }
}

/// Store of runtime preferences shared between the runner and the simulator.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<PrefValue>;
    fn set(&self, key: &str, value: PrefValue);
    /// Copy of the full preference map.
    fn snapshot(&self) -> BTreeMap<String, PrefValue>;
    /// Replaces the full preference map with a previously taken snapshot.
    fn restore(&self, snapshot: BTreeMap<String, PrefValue>);
    /// Replaces the full preference map with the built-in defaults.
    fn reset_to_defaults(&self);
}

/// In-memory preference store with a fixed defaults map.
#[derive(Debug, Clone, Default)]
pub struct MemoryPrefs {
    defaults: Arc<BTreeMap<String, PrefValue>>,
    values: Arc<RwLock<BTreeMap<String, PrefValue>>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose initial values and defaults are both `defaults`.
    pub fn with_defaults(defaults: BTreeMap<String, PrefValue>) -> Self {
        Self {
            values: Arc::new(RwLock::new(defaults.clone())),
            defaults: Arc::new(defaults),
        }
    }

    fn read_values(&self) -> RwLockReadGuard<'_, BTreeMap<String, PrefValue>> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_values(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PrefValue>> {
        self.values.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PreferenceStore for MemoryPrefs {
    fn get(&self, key: &str) -> Option<PrefValue> {
        self.read_values().get(key).cloned()
    }

    fn set(&self, key: &str, value: PrefValue) {
        self.write_values().insert(key.to_string(), value);
    }

    fn snapshot(&self) -> BTreeMap<String, PrefValue> {
        self.read_values().clone()
    }

    fn restore(&self, snapshot: BTreeMap<String, PrefValue>) {
        *self.write_values() = snapshot;
    }

    fn reset_to_defaults(&self) {
        *self.write_values() = (*self.defaults).clone();
    }
}

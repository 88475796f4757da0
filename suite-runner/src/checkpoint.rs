// Configuration checkpoint
// Captures preferences and the console log level, restoring them on all exit paths.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::logging::{LogControl, LogLevel};
use crate::prefs::{PrefValue, PreferenceStore};

/// Point-in-time capture of the mutable run configuration.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    preferences: BTreeMap<String, PrefValue>,
    console_level: LogLevel,
}

impl Checkpoint {
    pub fn capture(prefs: &dyn PreferenceStore, log: &dyn LogControl) -> Self {
        Self {
            preferences: prefs.snapshot(),
            console_level: log.console_level(),
        }
    }

    pub fn console_level(&self) -> LogLevel {
        self.console_level
    }

    /// Puts the captured state back. The log level always comes back,
    /// preferences only when `restore_preferences` is set.
    pub fn restore(
        self,
        prefs: &dyn PreferenceStore,
        log: &dyn LogControl,
        restore_preferences: bool,
    ) {
        if restore_preferences {
            prefs.restore(self.preferences);
        }
        log.set_console_level(self.console_level);
    }
}

/// Guard that restores a checkpoint when dropped.
///
/// Acquiring the guard captures the current state and raises the console
/// threshold to `Warning` so test output stays readable. Dropping the guard,
/// on any exit path including panics, puts the captured state back.
pub struct CheckpointGuard {
    checkpoint: Option<Checkpoint>,
    prefs: Arc<dyn PreferenceStore>,
    log: Arc<dyn LogControl>,
    restore_preferences: bool,
}

impl CheckpointGuard {
    pub fn acquire(
        prefs: Arc<dyn PreferenceStore>,
        log: Arc<dyn LogControl>,
        restore_preferences: bool,
    ) -> Self {
        let checkpoint = Checkpoint::capture(prefs.as_ref(), log.as_ref());
        log.set_console_level(LogLevel::Warning);
        Self {
            checkpoint: Some(checkpoint),
            prefs,
            log,
            restore_preferences,
        }
    }

    /// Restores eagerly instead of waiting for drop.
    pub fn restore(mut self) {
        self.restore_now();
    }

    fn restore_now(&mut self) {
        if let Some(checkpoint) = self.checkpoint.take() {
            checkpoint.restore(self.prefs.as_ref(), self.log.as_ref(), self.restore_preferences);
        }
    }
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        self.restore_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::SharedLogControl;
    use crate::prefs::MemoryPrefs;

    fn make_state() -> (Arc<MemoryPrefs>, Arc<SharedLogControl>) {
        let prefs = Arc::new(MemoryPrefs::new());
        prefs.set("codegen.target", PrefValue::from("llvm"));
        let log = Arc::new(SharedLogControl::new(LogLevel::Debug));
        (prefs, log)
    }

    #[test]
    fn acquire_raises_console_threshold() {
        let (prefs, log) = make_state();
        let guard = CheckpointGuard::acquire(prefs.clone(), log.clone(), true);
        assert_eq!(log.console_level(), LogLevel::Warning);
        drop(guard);
        assert_eq!(log.console_level(), LogLevel::Debug);
    }

    #[test]
    fn drop_restores_preferences() {
        let (prefs, log) = make_state();
        {
            let _guard = CheckpointGuard::acquire(prefs.clone(), log.clone(), true);
            prefs.set("codegen.target", PrefValue::from("cc"));
            prefs.set("scratch", PrefValue::Bool(true));
        }
        assert_eq!(prefs.get("codegen.target"), Some(PrefValue::from("llvm")));
        assert_eq!(prefs.get("scratch"), None);
    }

    #[test]
    fn preference_restore_can_be_skipped() {
        let (prefs, log) = make_state();
        {
            let _guard = CheckpointGuard::acquire(prefs.clone(), log.clone(), false);
            prefs.set("codegen.target", PrefValue::from("cc"));
        }
        // Log level comes back even when preferences stay.
        assert_eq!(prefs.get("codegen.target"), Some(PrefValue::from("cc")));
        assert_eq!(log.console_level(), LogLevel::Debug);
    }

    #[test]
    fn explicit_restore_disarms_the_guard() {
        let (prefs, log) = make_state();
        let guard = CheckpointGuard::acquire(prefs.clone(), log.clone(), true);
        prefs.set("codegen.target", PrefValue::from("cc"));
        guard.restore();
        assert_eq!(prefs.get("codegen.target"), Some(PrefValue::from("llvm")));

        // A later mutation must not be undone by a second restore.
        prefs.set("codegen.target", PrefValue::from("cc"));
        assert_eq!(prefs.get("codegen.target"), Some(PrefValue::from("cc")));
    }

    #[test]
    fn restores_after_a_panic() {
        let (prefs, log) = make_state();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = CheckpointGuard::acquire(prefs.clone(), log.clone(), true);
            prefs.set("codegen.target", PrefValue::from("cc"));
            panic!("phase exploded");
        }));
        assert!(result.is_err());
        assert_eq!(prefs.get("codegen.target"), Some(PrefValue::from("llvm")));
        assert_eq!(log.console_level(), LogLevel::Debug);
    }
}

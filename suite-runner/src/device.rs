// Device lifecycle
// State machine over simulation devices, from activation through build and reset.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::exec::env;

/// Name of the in-process runtime device.
pub const RUNTIME_DEVICE: &str = "runtime";
/// Name of the C standalone device.
pub const C_STANDALONE_DEVICE: &str = "c-standalone";

/// Lifecycle states a device moves through during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No device selected yet.
    Unset,
    /// A runtime device is active, running models in-process.
    ActiveRuntime,
    /// A standalone device is active and collecting code for a build.
    Building,
    /// The standalone build was produced and executed.
    Built,
    /// The device was torn down and its artifacts removed.
    Reset,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Unset => "unset",
            DeviceState::ActiveRuntime => "active-runtime",
            DeviceState::Building => "building",
            DeviceState::Built => "built",
            DeviceState::Reset => "reset",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unknown device '{0}'")]
    Unknown(String),

    #[error("cannot activate '{device}' while the device state is {state}; reset first")]
    Busy { device: String, state: DeviceState },

    #[error("no build in progress to complete (state is {0})")]
    NoBuild(DeviceState),

    #[error("device activation failed: {0}")]
    Activation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options for activating a device.
#[derive(Debug, Clone)]
pub struct ActivationOptions {
    /// Build directory for standalone devices. `None` lets the registry
    /// pick a fresh one.
    pub directory: Option<PathBuf>,
    /// Build and execute at the first run statement instead of waiting for
    /// an explicit build call.
    pub build_on_run: bool,
    /// Show compiler and build output.
    pub with_output: bool,
    /// Extra options forwarded to the device build.
    pub build_options: BTreeMap<String, String>,
}

impl Default for ActivationOptions {
    fn default() -> Self {
        Self {
            directory: None,
            build_on_run: true,
            with_output: false,
            build_options: BTreeMap::new(),
        }
    }
}

impl ActivationOptions {
    pub fn with_directory(mut self, directory: PathBuf) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_build_on_run(mut self, build_on_run: bool) -> Self {
        self.build_on_run = build_on_run;
        self
    }

    pub fn with_build_options(mut self, build_options: BTreeMap<String, String>) -> Self {
        self.build_options = build_options;
        self
    }
}

/// Backend store of devices that can be activated for a run.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Names of every device this registry can activate.
    fn known_devices(&self) -> Vec<String>;

    /// Whether the device generates a standalone project to build.
    fn is_standalone(&self, name: &str) -> bool;

    /// Makes `name` the active device.
    async fn activate(&self, name: &str, options: &ActivationOptions) -> Result<(), DeviceError>;

    /// Tears down the active device and removes its build artifacts.
    async fn reset(&self) -> Result<(), DeviceError>;

    /// Environment describing the active device to harness workers.
    fn execution_env(&self) -> HashMap<String, String>;
}

#[derive(Debug, Clone)]
struct ActiveDevice {
    name: String,
    directory: Option<PathBuf>,
    owned_directory: bool,
    build_on_run: bool,
    with_output: bool,
    build_options: BTreeMap<String, String>,
}

/// Registry over the devices compiled into this crate.
///
/// Standalone activations get a fresh build directory under the registry's
/// build root; `reset` deletes directories the registry created itself and
/// leaves caller-supplied ones alone.
pub struct LocalDeviceRegistry {
    build_root: PathBuf,
    active: RwLock<Option<ActiveDevice>>,
    sequence: AtomicU64,
}

impl LocalDeviceRegistry {
    /// Registry placing build directories under `build_root`.
    pub fn new(build_root: PathBuf) -> Self {
        Self {
            build_root,
            active: RwLock::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    /// Uses the user cache directory, falling back to the system temp dir.
    pub fn with_default_root() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("spindle")
            .join("builds");
        Self::new(root)
    }

    fn next_build_dir(&self, device: &str) -> PathBuf {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.build_root
            .join(format!("{}-{}-{}", device, std::process::id(), sequence))
    }
}

#[async_trait]
impl DeviceRegistry for LocalDeviceRegistry {
    fn known_devices(&self) -> Vec<String> {
        vec![RUNTIME_DEVICE.to_string(), C_STANDALONE_DEVICE.to_string()]
    }

    fn is_standalone(&self, name: &str) -> bool {
        name == C_STANDALONE_DEVICE
    }

    async fn activate(&self, name: &str, options: &ActivationOptions) -> Result<(), DeviceError> {
        if !self.known_devices().iter().any(|known| known == name) {
            return Err(DeviceError::Unknown(name.to_string()));
        }

        let entry = if self.is_standalone(name) {
            let (directory, owned) = match &options.directory {
                Some(directory) => (directory.clone(), false),
                None => (self.next_build_dir(name), true),
            };
            tokio::fs::create_dir_all(&directory).await?;
            ActiveDevice {
                name: name.to_string(),
                directory: Some(directory),
                owned_directory: owned,
                build_on_run: options.build_on_run,
                with_output: options.with_output,
                build_options: options.build_options.clone(),
            }
        } else {
            ActiveDevice {
                name: name.to_string(),
                directory: None,
                owned_directory: false,
                build_on_run: false,
                with_output: options.with_output,
                build_options: BTreeMap::new(),
            }
        };

        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(entry);
        Ok(())
    }

    async fn reset(&self) -> Result<(), DeviceError> {
        // Take the entry first so the lock is not held across the removal.
        let taken = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(device) = taken {
            if device.owned_directory {
                if let Some(directory) = &device.directory {
                    if directory.exists() {
                        tokio::fs::remove_dir_all(directory).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn execution_env(&self) -> HashMap<String, String> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        let mut variables = HashMap::new();
        if let Some(device) = active.as_ref() {
            variables.insert(env::DEVICE.to_string(), device.name.clone());
            variables.insert(
                env::BUILD_ON_RUN.to_string(),
                if device.build_on_run { "1" } else { "0" }.to_string(),
            );
            variables.insert(
                env::WITH_OUTPUT.to_string(),
                if device.with_output { "1" } else { "0" }.to_string(),
            );
            if let Some(directory) = &device.directory {
                variables.insert(env::DEVICE_DIR.to_string(), directory.display().to_string());
            }
            if !device.build_options.is_empty() {
                if let Ok(encoded) = serde_json::to_string(&device.build_options) {
                    variables.insert(env::BUILD_OPTIONS.to_string(), encoded);
                }
            }
        }
        variables
    }
}

/// Drives a device registry through the lifecycle state machine.
pub struct DeviceController {
    registry: Arc<dyn DeviceRegistry>,
    state: DeviceState,
    active: Option<String>,
}

impl DeviceController {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            registry,
            state: DeviceState::Unset,
            active: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn active_device(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Activates the in-process runtime device.
    ///
    /// Valid from `Unset`, `Reset` and `ActiveRuntime`. A standalone device
    /// must be reset before the runtime can take over again.
    pub async fn activate_runtime(&mut self) -> Result<(), DeviceError> {
        if matches!(self.state, DeviceState::Building | DeviceState::Built) {
            return Err(DeviceError::Busy {
                device: RUNTIME_DEVICE.to_string(),
                state: self.state,
            });
        }
        self.registry
            .activate(RUNTIME_DEVICE, &ActivationOptions::default())
            .await?;
        self.state = DeviceState::ActiveRuntime;
        self.active = Some(RUNTIME_DEVICE.to_string());
        Ok(())
    }

    /// Activates a standalone device, entering the build phase.
    pub async fn activate_standalone(
        &mut self,
        name: &str,
        options: &ActivationOptions,
    ) -> Result<(), DeviceError> {
        if matches!(self.state, DeviceState::Building | DeviceState::Built) {
            return Err(DeviceError::Busy {
                device: name.to_string(),
                state: self.state,
            });
        }
        self.registry.activate(name, options).await?;
        self.state = DeviceState::Building;
        self.active = Some(name.to_string());
        Ok(())
    }

    /// Marks the pending standalone build as produced and executed.
    pub fn complete_build(&mut self) -> Result<(), DeviceError> {
        if self.state != DeviceState::Building {
            return Err(DeviceError::NoBuild(self.state));
        }
        self.state = DeviceState::Built;
        Ok(())
    }

    /// Tears the active device down and removes its build artifacts.
    ///
    /// Resetting an unset or already reset controller is a no-op.
    pub async fn reset(&mut self) -> Result<(), DeviceError> {
        if matches!(self.state, DeviceState::Unset | DeviceState::Reset) {
            return Ok(());
        }
        self.registry.reset().await?;
        self.state = DeviceState::Reset;
        self.active = None;
        Ok(())
    }

    /// Environment describing the active device to harness workers.
    pub fn execution_env(&self) -> HashMap<String, String> {
        self.registry.execution_env()
    }
}

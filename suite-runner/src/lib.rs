// Suite Runner Library
// Test matrix orchestration across code generation targets and simulation devices

pub mod caches;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod exec;
pub mod filter;
pub mod logging;
pub mod plan;
pub mod prefs;
pub mod suite;

// Re-export commonly used types
pub use error::{SuiteError, SuiteResult};

// Re-export configuration types
pub use config::{FloatPrecision, ParallelConfig, RunConfig, TargetSelection};

// Re-export device types
pub use device::{
    ActivationOptions, DeviceController, DeviceError, DeviceRegistry, DeviceState,
    LocalDeviceRegistry, C_STANDALONE_DEVICE, RUNTIME_DEVICE,
};

// Re-export planning types
pub use plan::{MatrixPlanner, RunPlan, Target, TargetProbe, ToolchainProbe};

// Re-export execution types
pub use exec::{ExecReport, ExecRequest, ProcessExecutor, TestExecutor};

// Re-export runner types
pub use events::{progress_channel, EventSender, ProgressReceiver, ProgressSender, SuiteEvent};
pub use suite::{PhaseOutcome, RunReport, SuiteRunner};

use crate::output;

use clap::Args;
use color_eyre::Result;

use suite_runner::plan::{CC, INTERP, LLVM};
use suite_runner::{DeviceRegistry, LocalDeviceRegistry, TargetProbe, ToolchainProbe};

/// Show which targets and devices are available on this machine
#[derive(Args, Debug)]
pub struct TargetsArgs {
    /// Also list devices the local registry can activate
    #[arg(long)]
    pub devices: bool,
}

pub fn execute(args: TargetsArgs) -> Result<()> {
    let probe = ToolchainProbe;

    output::header("Code generation targets");
    for target in [INTERP, CC, LLVM] {
        if probe.available(target) {
            output::check(target);
        } else {
            output::failure(&format!("{} (toolchain not found)", target));
        }
    }

    if args.devices {
        let registry = LocalDeviceRegistry::with_default_root();
        output::header("Devices");
        for device in registry.known_devices() {
            output::check(&device);
        }
    }

    Ok(())
}

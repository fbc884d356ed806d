use clap::Args;
use trapmon_core::RecordReplay;

use super::common::{build_world, BootArgs};

/// Bring a monitor session up with no log attached and report the state it
/// reaches. Without a bare-metal entry point to resume the guest at, this is
/// the boot-and-dispatch path in isolation; `record`/`replay` exercise the
/// same path paired with a log.
#[derive(Args)]
pub struct Cmd {
    #[command(flatten)]
    pub boot: BootArgs,
}

impl Cmd {
    pub fn execute(&self) {
        match build_world(&self.boot, RecordReplay::Off) {
            Ok((world, boot)) => {
                log::info!(
                    "run: session up, {} RAM page(s), fault counters: {:?}",
                    boot.ram_pages(),
                    world.fault_counters
                );
            }
            Err(err) => {
                log::error!("run: {err}");
                std::process::exit(1);
            }
        }
    }
}

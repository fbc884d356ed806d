//! Bring a session up paired with an existing record log and pump it: every
//! entry due at the VCPU's current `n_exec` is consumed and reported, until
//! the log ends or a mismatch aborts it.

use std::fs::File;
use std::io::{BufRead, BufReader};

use clap::Args;
use thiserror::Error;
use trapmon_core::RecordReplay;
use trapmon_replay::{ReplayEngine, ReplayEvent, ReplayLog};

use super::common::{build_world, BootArgs, BootError};

#[derive(Args)]
pub struct Cmd {
    #[command(flatten)]
    pub boot: BootArgs,

    /// Path to the record/replay log to read back.
    #[arg(long)]
    pub log: String,
}

#[derive(Debug, Error)]
enum ReplayCmdError {
    #[error("opening log {path:?} for reading: {source}")]
    Log { path: String, source: std::io::Error },
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error(transparent)]
    Replay(#[from] trapmon_replay::ReplayError),
}

impl Cmd {
    pub fn execute(&self) {
        if let Err(err) = self.run() {
            log::error!("replay: {err}");
            std::process::exit(1);
        }
    }

    fn run(&self) -> Result<(), ReplayCmdError> {
        let file = File::open(&self.log).map_err(|source| ReplayCmdError::Log {
            path: self.log.clone(),
            source,
        })?;
        let reader: Box<dyn BufRead> = Box::new(BufReader::new(file));
        let engine = ReplayEngine::new(ReplayLog::new(reader));

        let (mut world, boot) = build_world(&self.boot, RecordReplay::Replay(engine))?;
        log::info!(
            "replay: session up, {} RAM page(s), reading {:?}",
            boot.ram_pages(),
            self.log
        );

        // With no translator to retire instructions and advance n_exec,
        // every entry due at n_exec 0 is as far as this harness can pump;
        // a real driver loop would bump n_exec between calls.
        let mut events = 0u64;
        while let Some(event) = world.pump_replay()? {
            events += 1;
            match event {
                ReplayEvent::MachineState(logged) => {
                    let here = world.snapshot();
                    if here.eip != logged.eip {
                        log::warn!(
                            "replay: checkpoint eip mismatch: guest at {:#010x}, log has {:#010x}",
                            here.eip,
                            logged.eip
                        );
                    } else {
                        log::info!("replay: checkpoint matched at eip {:#010x}", here.eip);
                    }
                }
                ReplayEvent::Intr(vector) => {
                    log::info!("replay: logged interrupt {vector:#04x}");
                }
                ReplayEvent::Panic => {
                    log::error!("replay: log records a guest panic");
                    std::process::exit(1);
                }
                ReplayEvent::Exit => {
                    log::info!("replay: log ends cleanly");
                    break;
                }
            }
        }
        log::info!("replay: {events} event(s) consumed");
        Ok(())
    }
}

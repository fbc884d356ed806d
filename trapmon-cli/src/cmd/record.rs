//! Bring a session up paired with a fresh record log, and write the initial
//! checkpoint. Without a bare-metal entry point to actually retire guest
//! instructions, this is as far as `trapmon-cli` can drive a recording; a
//! real loader-and-translator layer would keep calling into the same
//! `RecordEngine` as `n_exec` advances.

use std::fs::File;
use std::io::{BufWriter, Write};

use clap::Args;
use thiserror::Error;
use trapmon_core::RecordReplay;
use trapmon_replay::{RecordEngine, RecordLog};

use super::common::{build_world, BootArgs, BootError};

#[derive(Args)]
pub struct Cmd {
    #[command(flatten)]
    pub boot: BootArgs,

    /// Path to write the record/replay log to.
    #[arg(long)]
    pub log: String,

    /// Retired-instruction interval between periodic machine-state
    /// checkpoints; `0` disables them.
    #[arg(long, default_value_t = 0)]
    pub checkpoint_period: u64,
}

#[derive(Debug, Error)]
enum RecordError {
    #[error("opening log {path:?} for writing: {source}")]
    Log { path: String, source: std::io::Error },
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error(transparent)]
    Replay(#[from] trapmon_replay::ReplayError),
}

impl Cmd {
    pub fn execute(&self) {
        if let Err(err) = self.run() {
            log::error!("record: {err}");
            std::process::exit(1);
        }
    }

    fn run(&self) -> Result<(), RecordError> {
        let file = File::create(&self.log).map_err(|source| RecordError::Log {
            path: self.log.clone(),
            source,
        })?;
        let writer: Box<dyn Write> = Box::new(BufWriter::new(file));
        let engine = RecordEngine::new(RecordLog::new(writer), self.checkpoint_period);

        let (mut world, boot) = build_world(&self.boot, RecordReplay::Record(engine))?;

        // No translator drives n_exec forward here, so the only entry this
        // session can honestly emit is the opening checkpoint, at n_exec 0.
        let snapshot = world.snapshot();
        let ram = world.ram.as_slice().to_vec();
        let eip = world.vcpu.eip;
        if let RecordReplay::Record(engine) = &mut world.rr {
            engine.log_mut().write_machine_state(0, eip, &snapshot, &ram)?;
        }

        log::info!(
            "record: session up, {} RAM page(s), logging to {:?}",
            boot.ram_pages(),
            self.log
        );
        Ok(())
    }
}

//! Top-level error type and the outcome every dispatched trap reduces to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Paging(#[from] trapmon_paging::PagingError),
    #[error(transparent)]
    Walk(#[from] trapmon_paging::WalkError),
    #[error(transparent)]
    Gdt(#[from] trapmon_gdt::error::GdtError),
    #[error(transparent)]
    Dispatch(#[from] trapmon_fault::DispatchError),
    #[error(transparent)]
    Mem(#[from] trapmon_mem::MemError),
    #[error(transparent)]
    Io(#[from] trapmon_io::IoError),
    #[error(transparent)]
    Replay(#[from] trapmon_replay::ReplayError),
}

pub type Result<T> = core::result::Result<T, CoreError>;

/// What the monitor decided to do after handling one trapped event, as
/// reported back to whatever drives the VCPU loop (`trapmon-cli`'s `run`
/// subcommand, or a test harness). Mirrors the three-way split the reference
/// monitor's main loop makes between "keep running", "deliver and keep
/// running" and "stop".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The fault was fully resolved inside the monitor; the guest resumes at
    /// its original `eip` without ever observing the trap (a shadow fault or
    /// a resolved memory trace).
    Recovered,
    /// The event was delivered to the guest's own handler; the guest resumes
    /// at the handler's entry point instead of where it trapped.
    GuestFault,
    /// The monitor cannot continue: a fault attributed to its own code
    /// segment, an unimplemented forced callout, or a replay log that
    /// disagrees with the guest it's paired with.
    Abort(&'static str),
}

//! Exception classification and resolution: which guest/host context a
//! trapped `#PF`/`#GP` landed in, what that implies, and the CPL/`CR3`
//! bookkeeping every privileged operation is bracketed by.
//!
//! Grounded in `sys/exception.c`, `sys/mode.c` and `mem/pt_mode.c` in the
//! reference monitor this crate reimplements the dispatch half of.

pub mod dispatch;
pub mod error;
pub mod mode;
pub mod passthrough;

pub use dispatch::{
    dispatch_forced_callout, dispatch_gpf, dispatch_page_fault, CalloutId, FaultCounters,
    FaultOutcome, FaultingPt, GpfRule, GpfRuleTable, PageFaultInputs, PfErrorCode,
};
pub use error::{DispatchError, Result};
pub use mode::{Cpl, ModeSwitcher, PtAddrs, PtTarget};
pub use passthrough::{dispatch_passthrough, GuestCpuView, PassthroughFrame};

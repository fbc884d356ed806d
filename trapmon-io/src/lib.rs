//! I/O-port interposition: every guest `in`/`out` is dispatched to a
//! registered device and, for ports marked loggable, recorded or replayed
//! through an [`IoJournal`].
//!
//! Grounded in `sys/io.c` in the reference monitor.

pub mod bitmap;
pub mod error;
pub mod journal;
pub mod ring;

pub use bitmap::PortBitmap;
pub use error::{IoError, Result};
pub use journal::{IoJournal, IoWidth};
pub use ring::{PortRing, ReadHandler, RrMode, WriteHandler};

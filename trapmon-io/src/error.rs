use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    /// A width that doesn't fit the requested buffer was requested of
    /// `rr_ins`/`rr_outs`. Everything else about an unregistered port is a
    /// logged no-op (§7: "unknown I/O port — treated as no-op"), not an
    /// error; this is the one genuinely malformed-call case.
    #[error("string I/O of {requested} bytes does not divide evenly by width {width}")]
    MisalignedStringIo { requested: usize, width: usize },
}

pub type Result<T> = core::result::Result<T, IoError>;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GdtError {
    #[error("selector {selector:#06x} is outside the guest's GDT (limit {limit:#06x})")]
    OutOfRange { selector: u16, limit: u16 },

    #[error("LDT selectors are not supported")]
    LdtNotSupported,

    #[error("guest GDT limit {limit:#06x} overlaps the monitor's reserved selectors")]
    GuestGdtTooLarge { limit: u16 },
}

pub type Result<T> = core::result::Result<T, GdtError>;

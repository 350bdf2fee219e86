use alloc::boxed::Box;
use thiserror::Error;

/// Errors that can occur during EEPROM operations. The list is likely to stay as is but marked as
/// non-exhaustive to allow for future additions without breaking the API. Any error from
/// [`read_word`](crate::Eeprom::read_word) or [`write_word`](crate::Eeprom::write_word) means the
/// operation did not complete; the caller owns the retry policy.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the size of a flash sector (4k)
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The flash is too small to hold the three emulation pages at the given offset
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// The flash read primitive reported a failure
    #[error("flash read error")]
    FlashRead,

    /// The flash program primitive reported a failure
    #[error("flash write error")]
    FlashWrite,

    /// A sector erase failed, or a page still held programmed bits after erase and one retry
    #[error("flash erase error")]
    FlashErase,

    /// The slot id is outside `0..256`
    #[error("invalid slot address")]
    InvalidAddress,

    /// The element read back after programming differs from what was written
    #[error("write check failed")]
    WriteCheckFailed,

    /// The slot has never been written on the active page
    #[error("no data for slot")]
    NoData,

    /// The cached element address lies outside the active page. The in-memory map no longer
    /// matches the flash; surfaced immediately, never retried.
    #[error("invalid entry address")]
    InvalidEntry,

    /// The append cursor points at a location that is not erased. The in-memory map no longer
    /// matches the flash; surfaced immediately, never retried.
    #[error("element not empty")]
    ElementNotEmpty,

    /// The slot id stored in the element does not match the requested slot
    #[error("slot address mismatch")]
    AddrMismatch,

    /// The element failed its parity check, indicating bit-level corruption
    #[error("element parity check failed")]
    Parity,

    /// No page carries the commit marker. Either `init` has not run yet or the store needs a
    /// `format`.
    #[error("no valid page found")]
    NoPageFound,

    /// Programming or verifying a page header failed
    #[error("page header error")]
    PageHeader,

    /// A page transfer failed while migrating live data; carries the originating error so
    /// callers can tell a lost value from a flash hardware fault
    #[error("page transfer failed: {0}")]
    Transfer(#[source] Box<Error>),

    /// The page headers are in an unrecoverable state (no valid page, or all three valid).
    /// The caller must invoke [`format`](crate::Eeprom::format) before further use.
    #[error("invalid page headers")]
    InvalidHeader,
}

impl Error {
    /// Wraps `self` as the cause of a failed transfer, unless it already is one.
    pub(crate) fn into_transfer(self) -> Error {
        match self {
            Error::Transfer(_) => self,
            other => Error::Transfer(Box::new(other)),
        }
    }
}

//! Common error definitions.

use crate::{flash::FlashError, qspi::QspiError};

macro_rules! impl_from_error {
    ($error:ident) => {
        impl From<$error> for Error {
            fn from(error: $error) -> Self {
                Self::$error(error)
            }
        }
    };
}

/// Alias for Result<T, Error>.
pub type Result<T> = core::result::Result<T, Error>;

/// Collection of all errors that can occur.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Errors from the QUADSPI peripheral, including timeouts.
    QspiError(QspiError),
    /// The flash chip isn't in the state a command requires.
    FlashError(FlashError),
    /// The diagnostic output sink refused a write.
    Format,
}

impl_from_error!(QspiError);
impl_from_error!(FlashError);

impl From<core::fmt::Error> for Error {
    fn from(_: core::fmt::Error) -> Self {
        Self::Format
    }
}

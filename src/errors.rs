// SPDX-License-Identifier: MIT

//! A module to provide a convenient wrapper around all error types

use crate::cfb::CfbError;
use crate::xls::XlsError;
use crate::xlsx::XlsxError;

/// The crate error type, wrapping every format-specific error.
#[derive(Debug)]
pub enum Error {
    /// IO error
    Io(std::io::Error),
    /// The requested file does not exist
    FileNotFound(String),
    /// The file signature matches neither a ZIP package nor a compound file
    InvalidFile,
    /// The requested sheet name is absent from the workbook
    SheetNotFound(String),
    /// Compound-file specific error
    Cfb(CfbError),
    /// Legacy xls specific error
    Xls(XlsError),
    /// Xlsx specific error
    Xlsx(XlsxError),
}

/// Coarse classification of an [`Error`], for callers that translate
/// engine failures into a transport-level error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself was unusable: missing file, unrecognized
    /// signature or unknown sheet name.
    InvalidRequest,
    /// The file carried the right signature but its contents could not
    /// be parsed: missing workbook stream, encrypted package, broken part.
    InvalidFormat,
    /// An unexpected runtime failure.
    Internal,
}

impl Error {
    /// Classify this error into one of the three [`ErrorKind`]s.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FileNotFound(_) | Error::InvalidFile | Error::SheetNotFound(_) => {
                ErrorKind::InvalidRequest
            }
            Error::Cfb(_) | Error::Xls(_) | Error::Xlsx(_) => ErrorKind::InvalidFormat,
            Error::Io(_) => ErrorKind::Internal,
        }
    }
}

from_err!(std::io::Error, Error, Io);
from_err!(CfbError, Error, Cfb);
from_err!(XlsError, Error, Xls);
from_err!(XlsxError, Error, Xlsx);

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::FileNotFound(path) => write!(f, "File not found: {path}"),
            Error::InvalidFile => {
                write!(f, "Invalid file: expecting a ZIP or compound-file signature")
            }
            Error::SheetNotFound(name) => write!(f, "Sheet '{name}' not found"),
            Error::Cfb(e) => write!(f, "Cfb error: {e}"),
            Error::Xls(e) => write!(f, "Xls error: {e}"),
            Error::Xlsx(e) => write!(f, "Xlsx error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Cfb(e) => Some(e),
            Error::Xls(e) => Some(e),
            Error::Xlsx(e) => Some(e),
            _ => None,
        }
    }
}

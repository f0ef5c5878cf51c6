//! Response codes — the error taxonomy shared by both peers.
//!
//! A `Response` frame carries only the numeric code; the text is derived
//! from the code on whichever side needs to display it.

use std::fmt;

use crate::wire::WireError;

/// Terminal outcome of a request, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResponseCode {
    Ok = 0,
    /// Requested source path does not exist.
    FileNotFound = 4000,
    /// Requested source path is a directory.
    NotAFile = 4001,
    /// Unclassified failure while processing.
    InternalError = 5000,
    /// Idle timeout fired before a terminal response arrived.
    PeerNotResponding = 5001,
}

impl ResponseCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a code received on the wire.
    pub fn from_code(value: u32) -> Result<Self, WireError> {
        Self::try_from(value)
    }

    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }

    /// Default user-facing text for this code.
    pub fn message(self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK.",
            ResponseCode::FileNotFound => "The file does not exist.",
            ResponseCode::NotAFile => "Item is not a file.",
            ResponseCode::InternalError => "Internal system error.",
            ResponseCode::PeerNotResponding => "No response from peer.",
        }
    }
}

impl TryFrom<u32> for ResponseCode {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseCode::Ok),
            4000 => Ok(ResponseCode::FileNotFound),
            4001 => Ok(ResponseCode::NotAFile),
            5000 => Ok(ResponseCode::InternalError),
            5001 => Ok(ResponseCode::PeerNotResponding),
            other => Err(WireError::UnknownResponseCode(other)),
        }
    }
}

impl From<ResponseCode> for u32 {
    fn from(code: ResponseCode) -> u32 {
        code.code()
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

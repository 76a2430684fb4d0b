//! Error values and the crate error type.
//!
//! On the wire an error is a single unsigned integer: the low 16 bits carry
//! the code and bits 24..=30 carry the source tag. The code and source
//! vocabularies belong to an external, frozen table; this module only names
//! the values the protocol layer itself produces.

use std::fmt;
use std::io;
use thiserror::Error;

const CODE_MASK: u32 = 0xFFFF;
const SOURCE_MASK: u32 = 0x7F;
const SOURCE_SHIFT: u32 = 24;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error source tag (7 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorSource(u8);

impl ErrorSource {
    pub const UNKNOWN: ErrorSource = ErrorSource(0);
    pub const GCRYPT: ErrorSource = ErrorSource(1);
    pub const GPG: ErrorSource = ErrorSource(2);
    pub const GPGSM: ErrorSource = ErrorSource(3);
    pub const GPGAGENT: ErrorSource = ErrorSource(4);
    pub const PINENTRY: ErrorSource = ErrorSource(5);
    pub const SCD: ErrorSource = ErrorSource(6);
    pub const GPGME: ErrorSource = ErrorSource(7);
    pub const DIRMNGR: ErrorSource = ErrorSource(10);
    pub const ASSUAN: ErrorSource = ErrorSource(15);
    pub const USER_1: ErrorSource = ErrorSource(32);
    pub const USER_2: ErrorSource = ErrorSource(33);
    pub const USER_3: ErrorSource = ErrorSource(34);
    pub const USER_4: ErrorSource = ErrorSource(35);

    /// Build a source tag; bits above the 7-bit field are dropped.
    pub const fn new(raw: u8) -> Self {
        ErrorSource(raw & SOURCE_MASK as u8)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

/// Error code (16 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0);
    pub const GENERAL: ErrorCode = ErrorCode(1);
    pub const INV_ARG: ErrorCode = ErrorCode(45);
    pub const INV_VALUE: ErrorCode = ErrorCode(55);
    pub const NOT_SUPPORTED: ErrorCode = ErrorCode(60);
    pub const TIMEOUT: ErrorCode = ErrorCode(62);
    pub const NOT_IMPLEMENTED: ErrorCode = ErrorCode(69);
    pub const CANCELED: ErrorCode = ErrorCode(99);
    pub const UNKNOWN_OPTION: ErrorCode = ErrorCode(174);
    pub const UNKNOWN_COMMAND: ErrorCode = ErrorCode(175);
    pub const ASS_GENERAL: ErrorCode = ErrorCode(257);
    pub const ASS_ACCEPT_FAILED: ErrorCode = ErrorCode(258);
    pub const ASS_CONNECT_FAILED: ErrorCode = ErrorCode(259);
    pub const ASS_INV_RESPONSE: ErrorCode = ErrorCode(260);
    pub const ASS_INV_VALUE: ErrorCode = ErrorCode(261);
    pub const ASS_INCOMPLETE_LINE: ErrorCode = ErrorCode(262);
    pub const ASS_LINE_TOO_LONG: ErrorCode = ErrorCode(263);
    pub const ASS_NESTED_COMMANDS: ErrorCode = ErrorCode(264);
    pub const ASS_NO_DATA_CB: ErrorCode = ErrorCode(265);
    pub const ASS_NO_INQUIRE_CB: ErrorCode = ErrorCode(266);
    pub const ASS_NOT_A_SERVER: ErrorCode = ErrorCode(267);
    pub const ASS_NOT_A_CLIENT: ErrorCode = ErrorCode(268);
    pub const ASS_SERVER_START: ErrorCode = ErrorCode(269);
    pub const ASS_READ_ERROR: ErrorCode = ErrorCode(270);
    pub const ASS_WRITE_ERROR: ErrorCode = ErrorCode(271);
    pub const ASS_TOO_MUCH_DATA: ErrorCode = ErrorCode(273);
    pub const ASS_UNEXPECTED_CMD: ErrorCode = ErrorCode(274);
    pub const ASS_UNKNOWN_CMD: ErrorCode = ErrorCode(275);
    pub const ASS_SYNTAX: ErrorCode = ErrorCode(276);
    pub const ASS_CANCELED: ErrorCode = ErrorCode(277);
    pub const ASS_NO_INPUT: ErrorCode = ErrorCode(278);
    pub const ASS_NO_OUTPUT: ErrorCode = ErrorCode(279);
    pub const ASS_PARAMETER: ErrorCode = ErrorCode(280);
    pub const ASS_UNKNOWN_INQUIRE: ErrorCode = ErrorCode(281);
    pub const EOF: ErrorCode = ErrorCode(16383);

    pub const fn new(raw: u16) -> Self {
        ErrorCode(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }
}

/// A packed `(source, code)` pair as carried in `ERR` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorValue(u32);

impl ErrorValue {
    /// Combine a source and a code. A zero code always yields the zero value.
    pub const fn new(source: ErrorSource, code: ErrorCode) -> Self {
        if code.0 == 0 {
            return ErrorValue(0);
        }
        ErrorValue(((source.0 as u32 & SOURCE_MASK) << SOURCE_SHIFT) | (code.0 as u32 & CODE_MASK))
    }

    pub const fn from_wire(raw: u32) -> Self {
        ErrorValue(raw)
    }

    pub const fn to_wire(self) -> u32 {
        self.0
    }

    pub const fn code(self) -> ErrorCode {
        ErrorCode((self.0 & CODE_MASK) as u16)
    }

    pub const fn source(self) -> ErrorSource {
        ErrorSource(((self.0 >> SOURCE_SHIFT) & SOURCE_MASK) as u8)
    }

    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Combine `source` and `code` into a wire error value.
pub const fn make_error(source: ErrorSource, code: ErrorCode) -> ErrorValue {
    ErrorValue::new(source, code)
}

/// Error type for protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// More than 1000 bytes arrived before a line terminator
    #[error("Line too long")]
    LineTooLong,

    /// The peer closed the stream in the middle of a line
    #[error("Incomplete line")]
    IncompleteLine,

    /// The peer closed the stream
    #[error("End of file")]
    Eof,

    #[error("Read error: {0}")]
    Read(#[source] io::Error),

    #[error("Write error: {0}")]
    Write(#[source] io::Error),

    /// A response line did not match any known class
    #[error("Invalid response")]
    InvalidResponse,

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unknown IPC command")]
    UnknownCommand,

    #[error("Unexpected IPC command")]
    UnexpectedCommand,

    #[error("No inquire callback in IPC client")]
    NoInquireCallback,

    #[error("Too much data for IPC layer")]
    TooMuchData,

    #[error("Operation cancelled")]
    Canceled,

    #[error("Nested IPC commands")]
    NestedCommands,

    #[error("IPC connect call failed: {0}")]
    ConnectFailed(String),

    #[error("IPC accept call failed: {0}")]
    AcceptFailed(String),

    #[error("Not an IPC server")]
    NotAServer,

    #[error("Not an IPC client")]
    NotAClient,

    #[error("IPC input FD not set")]
    NoInput,

    #[error("IPC output FD not set")]
    NoOutput,

    #[error("IPC parameter error: {0}")]
    Parameter(String),

    #[error("Invalid value passed to IPC: {0}")]
    InvalidValue(String),

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The context reached its terminal state
    #[error("Connection closed")]
    Closed,

    #[error("General IPC error: {0}")]
    General(String),

    #[error("System error: {0}")]
    Io(#[from] io::Error),

    /// An error carrying an explicit wire value, either received in an `ERR`
    /// line or chosen by a command handler.
    #[error("{text} ({value})")]
    Coded { value: ErrorValue, text: String },
}

impl Error {
    /// Build an error with an explicit code; the source is filled in from the
    /// context when the error is sent to the peer.
    pub fn with_code(code: ErrorCode, text: impl Into<String>) -> Self {
        Error::Coded {
            value: ErrorValue::new(ErrorSource::UNKNOWN, code),
            text: text.into(),
        }
    }

    /// Build an error from a received wire value.
    pub fn from_value(value: ErrorValue, text: impl Into<String>) -> Self {
        Error::Coded {
            value,
            text: text.into(),
        }
    }

    /// The code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::LineTooLong => ErrorCode::ASS_LINE_TOO_LONG,
            Error::IncompleteLine => ErrorCode::ASS_INCOMPLETE_LINE,
            Error::Eof => ErrorCode::EOF,
            Error::Read(_) => ErrorCode::ASS_READ_ERROR,
            Error::Write(_) => ErrorCode::ASS_WRITE_ERROR,
            Error::InvalidResponse => ErrorCode::ASS_INV_RESPONSE,
            Error::Syntax(_) => ErrorCode::ASS_SYNTAX,
            Error::UnknownCommand => ErrorCode::ASS_UNKNOWN_CMD,
            Error::UnexpectedCommand => ErrorCode::ASS_UNEXPECTED_CMD,
            Error::NoInquireCallback => ErrorCode::ASS_NO_INQUIRE_CB,
            Error::TooMuchData => ErrorCode::ASS_TOO_MUCH_DATA,
            Error::Canceled => ErrorCode::ASS_CANCELED,
            Error::NestedCommands => ErrorCode::ASS_NESTED_COMMANDS,
            Error::ConnectFailed(_) => ErrorCode::ASS_CONNECT_FAILED,
            Error::AcceptFailed(_) => ErrorCode::ASS_ACCEPT_FAILED,
            Error::NotAServer => ErrorCode::ASS_NOT_A_SERVER,
            Error::NotAClient => ErrorCode::ASS_NOT_A_CLIENT,
            Error::NoInput => ErrorCode::ASS_NO_INPUT,
            Error::NoOutput => ErrorCode::ASS_NO_OUTPUT,
            Error::Parameter(_) => ErrorCode::ASS_PARAMETER,
            Error::InvalidValue(_) => ErrorCode::ASS_INV_VALUE,
            Error::UnknownOption(_) => ErrorCode::UNKNOWN_OPTION,
            Error::NotSupported(_) => ErrorCode::NOT_SUPPORTED,
            Error::Closed | Error::General(_) | Error::Io(_) => ErrorCode::ASS_GENERAL,
            Error::Coded { value, .. } => value.code(),
        }
    }

    /// Compose the wire value. Coded errors keep a non-zero source they
    /// already carry; everything else is tagged with `source`.
    pub fn value(&self, source: ErrorSource) -> ErrorValue {
        match self {
            Error::Coded { value, .. } if value.source() != ErrorSource::UNKNOWN => *value,
            _ => ErrorValue::new(source, self.code()),
        }
    }

    /// Transport failures leave the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Read(_)
                | Error::Write(_)
                | Error::Eof
                | Error::IncompleteLine
                | Error::Closed
                | Error::ConnectFailed(_)
        )
    }

    /// Human readable text for an `ERR` line.
    pub(crate) fn describe(&self) -> String {
        match self {
            Error::Coded { text, .. } => text.clone(),
            other => other.to_string(),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(io::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_code_discards_source() {
        for raw in 0..=127u8 {
            let value = make_error(ErrorSource::new(raw), ErrorCode::NO_ERROR);
            assert_eq!(value.to_wire(), 0);
            assert!(value.is_ok());
        }
    }

    #[test]
    fn value_packs_source_and_code() {
        let value = make_error(ErrorSource::GPGAGENT, ErrorCode::ASS_UNKNOWN_CMD);
        assert_eq!(value.to_wire(), (4 << 24) | 275);
        assert_eq!(value.code(), ErrorCode::ASS_UNKNOWN_CMD);
        assert_eq!(value.source(), ErrorSource::GPGAGENT);

        let decoded = ErrorValue::from_wire(value.to_wire());
        assert_eq!(decoded, value);
        assert_eq!(decoded.to_string(), "67109139");
    }

    #[test]
    fn source_is_limited_to_seven_bits() {
        assert_eq!(ErrorSource::new(0xFF).raw(), 0x7F);
        let value = make_error(ErrorSource::new(0xFF), ErrorCode::GENERAL);
        assert_eq!(value.source().raw(), 0x7F);
    }

    #[test]
    fn coded_errors_keep_their_own_source() {
        let received = Error::from_value(
            make_error(ErrorSource::SCD, ErrorCode::CANCELED),
            "Operation cancelled",
        );
        assert_eq!(received.value(ErrorSource::ASSUAN).source(), ErrorSource::SCD);

        let local = Error::with_code(ErrorCode::NOT_IMPLEMENTED, "not yet");
        let value = local.value(ErrorSource::USER_1);
        assert_eq!(value.source(), ErrorSource::USER_1);
        assert_eq!(value.code(), ErrorCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn variants_map_to_protocol_codes() {
        assert_eq!(Error::LineTooLong.code(), ErrorCode::ASS_LINE_TOO_LONG);
        assert_eq!(Error::UnknownCommand.code(), ErrorCode::ASS_UNKNOWN_CMD);
        assert_eq!(Error::NoInquireCallback.code(), ErrorCode::ASS_NO_INQUIRE_CB);
        assert!(Error::Eof.is_fatal());
        assert!(!Error::UnknownCommand.is_fatal());
    }
}

use std::io;
use std::net;
use thiserror::Error;

pub type NetworkResult<T> = Result<T, NetworkError>;

/// Two-level error taxonomy for the socket layer. `Wait` is the non-blocking
/// "try again later" signal and never tears anything down, `Fatal` always
/// closes the offending connection.
#[derive(Debug, Eq, PartialEq, Error)]
pub enum NetworkError {
    #[error("operation would block")]
    Wait,
    #[error("fatal connection error: {0}")]
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Error)]
pub enum ErrorType {
    #[error("malformed frame header")]
    MalformedHeader,
    #[error("declared payload size out of bounds")]
    PayloadOutOfBounds,
    #[error("opcode outside the dispatch table range")]
    OpcodeOutOfRange,
    #[error("handshake reply mismatch")]
    BadHandshake,
    #[error("authentication attempted twice")]
    DuplicateAuth,
    #[error("packet requires a session but none is attached")]
    NoSession,
    #[error("outbound queue overflow")]
    SendQueueFull,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("connection already closed")]
    Closed,
    #[error("malformed packet payload")]
    Payload,
    #[error("address parse failure")]
    AddrParse,
    #[error("io failure: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

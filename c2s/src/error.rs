use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::str::Utf8Error;

use crate::{jid, minidom, stream_error::StreamError};

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Utf8 error
    Utf8(Utf8Error),
    /// An incoming element exceeded the configured size ceiling
    TooLargeStanza,
    /// The stream was terminated with the given stream error condition,
    /// either by us or on request of one of its modules
    Stream(StreamError),
    /// Connection closed
    Disconnected,
    /// Should never happen
    InvalidState,
}

impl Error {
    /// The stream error condition to report to the peer before closing the
    /// stream because of this error, if any.
    pub fn stream_condition(&self) -> Option<StreamError> {
        match self {
            Error::Stream(condition) => Some(*condition),
            Error::TooLargeStanza => Some(StreamError::PolicyViolation),
            Error::Protocol(ProtocolError::InvalidStanza(_)) => Some(StreamError::BadFormat),
            Error::Protocol(ProtocolError::NoTls) => None,
            Error::Protocol(ProtocolError::DataBeforeUpgrade) => Some(StreamError::PolicyViolation),
            Error::Protocol(_) | Error::Utf8(_) => Some(StreamError::NotWellFormed),
            Error::JidParse(_) => Some(StreamError::BadFormat),
            Error::InvalidState => Some(StreamError::InternalServerError),
            Error::Io(_) | Error::Disconnected => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Utf8(e) => write!(fmt, "Utf8 error: {}", e),
            Error::TooLargeStanza => write!(fmt, "stanza too large"),
            Error::Stream(e) => write!(fmt, "stream error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::JidParse(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<Utf8Error> for Error {
    fn from(e: Utf8Error) -> Self {
        Error::Utf8(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        ProtocolError::Xml(e).into()
    }
}

impl From<StreamError> for Error {
    fn from(e: StreamError) -> Self {
        Error::Stream(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error
    Parser(minidom::Error),
    /// XML tokenizer error while looking for element boundaries
    Xml(quick_xml::Error),
    /// Character data outside of any element
    UnexpectedText,
    /// A closing tag without a matching opening tag
    UnbalancedTag,
    /// Stream header expected first, something else received
    InvalidStreamStart,
    /// A stanza did not have the shape required by its kind
    InvalidStanza(&'static str),
    /// STARTTLS requested but no TLS configuration available
    NoTls,
    /// The peer kept sending after requesting TLS or compression, without
    /// waiting for the upgrade
    DataBeforeUpgrade,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::Xml(e) => write!(fmt, "XML tokenizer error: {}", e),
            ProtocolError::UnexpectedText => write!(fmt, "text outside of any element"),
            ProtocolError::UnbalancedTag => write!(fmt, "closing tag without opening tag"),
            ProtocolError::InvalidStreamStart => write!(fmt, "invalid stream start"),
            ProtocolError::InvalidStanza(e) => write!(fmt, "invalid stanza: {}", e),
            ProtocolError::NoTls => write!(fmt, "STARTTLS requested but not configured"),
            ProtocolError::DataBeforeUpgrade => {
                write!(fmt, "data received before the stream upgrade")
            }
        }
    }
}

impl StdError for ProtocolError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ProtocolError::Parser(e) => Some(e),
            ProtocolError::Xml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

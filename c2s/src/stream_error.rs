//! Stream error conditions sent before a stream is torn down.

use core::fmt;
use std::error::Error;

use minidom::Element;

use crate::ns;

/// Stream error conditions as defined in [RFC 6120] which this server may
/// send.
///
/// The [`Display`][`fmt::Display`] form of a condition is its XML element
/// name, which doubles as the machine-readable reason of a disconnection.
///
///    [RFC 6120]: https://datatracker.ietf.org/doc/html/rfc6120#section-4.9.3
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum StreamError {
    /// The entity has sent XML that cannot be processed.
    BadFormat,

    /// One party is closing the stream because it has reason to believe that
    /// the other party has permanently lost the ability to communicate over
    /// the stream.
    ConnectionTimeout,

    /// The value of the 'to' attribute provided in the initial stream header
    /// does not correspond to an FQDN that is serviced by the receiving
    /// entity.
    HostUnknown,

    /// The server has experienced a misconfiguration or other internal error
    /// that prevents it from servicing the stream.
    InternalServerError,

    /// The stream namespace name is something other than
    /// `http://etherx.jabber.org/streams` or the content namespace declared
    /// as the default namespace is not supported.
    InvalidNamespace,

    /// The entity has attempted to send data before the stream has been
    /// authenticated, or otherwise is not authorized to perform an action
    /// related to stream negotiation.
    NotAuthorized,

    /// The initiating entity has sent XML that violates the well-formedness
    /// rules of XML.
    NotWellFormed,

    /// The entity has violated some local service policy (e.g., a stanza
    /// exceeds a configured size limit).
    PolicyViolation,

    /// The server lacks the system resources necessary to service the
    /// stream.
    ResourceConstraint,

    /// The server is being shut down and all active streams are being
    /// closed.
    SystemShutdown,

    /// The error condition is not one of those defined by the other
    /// conditions in this list.
    UndefinedCondition,

    /// The initiating entity has sent a first-level child of the stream that
    /// is not supported by the server.
    UnsupportedStanzaType,

    /// The 'version' attribute provided by the initiating entity in the
    /// stream header specifies a version of XMPP that is not supported.
    UnsupportedVersion,
}

impl StreamError {
    /// The XML element name of this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamError::BadFormat => "bad-format",
            StreamError::ConnectionTimeout => "connection-timeout",
            StreamError::HostUnknown => "host-unknown",
            StreamError::InternalServerError => "internal-server-error",
            StreamError::InvalidNamespace => "invalid-namespace",
            StreamError::NotAuthorized => "not-authorized",
            StreamError::NotWellFormed => "not-well-formed",
            StreamError::PolicyViolation => "policy-violation",
            StreamError::ResourceConstraint => "resource-constraint",
            StreamError::SystemShutdown => "system-shutdown",
            StreamError::UndefinedCondition => "undefined-condition",
            StreamError::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamError::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error for StreamError {}

impl From<StreamError> for Element {
    fn from(condition: StreamError) -> Element {
        Element::builder("error", ns::STREAM)
            .append(Element::builder(condition.as_str(), ns::XMPP_STREAMS).build())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_timeout_reason() {
        assert_eq!(StreamError::ConnectionTimeout.to_string(), "connection-timeout");
    }

    #[test]
    fn serialise() {
        let elem = Element::from(StreamError::HostUnknown);
        assert!(elem.is("error", ns::STREAM));
        let condition = elem.children().next().unwrap();
        assert!(condition.is("host-unknown", ns::XMPP_STREAMS));
        assert_eq!(elem.children().count(), 1);
    }
}

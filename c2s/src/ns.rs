//! XML namespaces used on client-to-server streams.

/// RFC 6120: XMPP Core, default namespace of client streams
pub const JABBER_CLIENT: &str = "jabber:client";
/// RFC 6120: XMPP Core, stream header, features and errors
pub const STREAM: &str = "http://etherx.jabber.org/streams";
/// RFC 6120: XMPP Core, STARTTLS negotiation
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// RFC 6120: XMPP Core, SASL negotiation
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// RFC 6120: XMPP Core, resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// RFC 6120: XMPP Core, stanza error conditions
pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// RFC 6120: XMPP Core, stream error conditions
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// RFC 3921: XMPP IM, legacy session establishment
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// XEP-0138: Stream Compression, negotiation protocol
pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
/// XEP-0138: Stream Compression, stream feature
pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";

/// XEP-0199: XMPP Ping
pub const PING: &str = "urn:xmpp:ping";

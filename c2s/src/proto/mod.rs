//! Low-level stream framing

use minidom::Element;
use rand::{thread_rng, Rng};

use crate::ns;

mod xmpp_codec;

pub use xmpp_codec::XmppCodec;
pub(crate) use xmpp_codec::open_tag;

/// Generate a random id for streams, stanzas and resources.
pub fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// Anything that can be sent or received on an XMPP/XML stream
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `<stream:stream>` start tag
    StreamStart(StreamHeader),
    /// A complete top-level element
    Stanza(Element),
    /// Raw text, sent as is
    Text(String),
    /// `</stream:stream>` closing tag
    StreamEnd,
}

/// Contains metadata from an XML stream header
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamHeader {
    /// The optional `from` attribute.
    pub from: Option<String>,

    /// The optional `to` attribute.
    pub to: Option<String>,

    /// The optional `id` attribute.
    pub id: Option<String>,

    /// The optional `version` attribute.
    pub version: Option<String>,

    /// The optional `xml:lang` attribute.
    pub lang: Option<String>,

    /// The default namespace declared on the header, if any.
    pub default_ns: Option<String>,
}

impl StreamHeader {
    /// Whether the peer announced XMPP 1.x.
    pub fn is_version_1(&self) -> bool {
        match self.version.as_deref() {
            Some(version) => version.split('.').next() == Some("1"),
            None => false,
        }
    }

    /// The header as a childless `<stream:stream/>` element, to be written
    /// without its closing tag.
    pub fn to_element(&self) -> Element {
        Element::builder("stream", ns::STREAM)
            .attr("from", self.from.clone())
            .attr("to", self.to.clone())
            .attr("id", self.id.clone())
            .attr("version", self.version.clone())
            .attr("xml:lang", self.lang.clone())
            .build()
    }
}

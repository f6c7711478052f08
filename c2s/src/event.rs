use jid::FullJid;
use minidom::Element;

use crate::stream_error::StreamError;

/// High-level event on the Stream implemented by [`Stream`][crate::Stream]
#[derive(Debug)]
pub enum Event {
    /// Resource binding succeeded; the stream now routes stanzas.
    Online {
        /// Server-acknowledged full JID of the client
        bound_jid: FullJid,
    },
    /// A message or presence stanza from the client, with `from` set to its
    /// bound JID. Routing it is up to the receiver.
    Stanza(Element),
    /// The stream is gone; no further events follow.
    Disconnected {
        /// The condition the stream was terminated with, if it did not end
        /// cleanly.
        reason: Option<StreamError>,
    },
}

impl Event {
    /// `Online` event?
    pub fn is_online(&self) -> bool {
        matches!(self, Event::Online { .. })
    }

    /// Get the server-assigned JID for the `Online` event
    pub fn get_jid(&self) -> Option<&FullJid> {
        match self {
            Event::Online { bound_jid, .. } => Some(bound_jid),
            _ => None,
        }
    }

    /// If this is a `Stanza` event, get its data
    pub fn as_stanza(&self) -> Option<&Element> {
        match self {
            Event::Stanza(stanza) => Some(stanza),
            _ => None,
        }
    }
}

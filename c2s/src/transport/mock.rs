//! In-memory [`Transport`] for driving streams in tests.

use minidom::Element;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use super::{ChannelBindingType, Transport};
use crate::config::CompressionLevel;
use crate::error::Error;
use crate::proto::Packet;

/// Something the stream wrote to a [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Written {
    /// A raw string.
    Raw(String),
    /// A complete element.
    Element(Element),
    /// The opening tag of an element, without closing.
    OpenTag(Element),
    /// The TLS handshake was performed.
    TlsStarted,
    /// Compression was enabled.
    CompressionEnabled(CompressionLevel),
    /// The transport was closed.
    Closed,
}

/// A [`Transport`] backed by in-memory queues, see [`MockTransport::pair`].
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Packet>,
    outbound: mpsc::UnboundedSender<Written>,
    secured: bool,
    compressed: bool,
    closed: bool,
    channel_binding: Option<Vec<u8>>,
}

/// The client end of a [`MockTransport`].
pub struct MockPeer {
    inbound: mpsc::UnboundedSender<Packet>,
    outbound: mpsc::UnboundedReceiver<Written>,
}

impl MockTransport {
    /// Create a transport and the peer feeding it.
    pub fn pair() -> (MockTransport, MockPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            MockTransport {
                inbound: inbound_rx,
                outbound: outbound_tx,
                secured: false,
                compressed: false,
                closed: false,
                channel_binding: None,
            },
            MockPeer {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }

    /// Channel binding data reported once [`Transport::start_tls`] ran.
    pub fn with_channel_binding(mut self, data: Vec<u8>) -> Self {
        self.channel_binding = Some(data);
        self
    }

    fn emit(&mut self, written: Written) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        // A peer which went away does not fail writes, like a socket whose
        // remote end closed its read half.
        let _ = self.outbound.send(written);
        Ok(())
    }
}

impl Transport for MockTransport {
    async fn read_element(&mut self) -> Result<Packet, Error> {
        if self.closed {
            return Err(Error::Disconnected);
        }
        self.inbound.recv().await.ok_or(Error::Disconnected)
    }

    async fn write_string(&mut self, raw: &str) -> Result<(), Error> {
        self.emit(Written::Raw(raw.to_owned()))
    }

    async fn write_element(&mut self, elem: &Element, include_closing: bool) -> Result<(), Error> {
        if include_closing {
            self.emit(Written::Element(elem.clone()))
        } else {
            self.emit(Written::OpenTag(elem.clone()))
        }
    }

    async fn start_tls(&mut self, _acceptor: TlsAcceptor) -> Result<(), Error> {
        if self.secured {
            return Err(Error::InvalidState);
        }
        self.emit(Written::TlsStarted)?;
        self.secured = true;
        Ok(())
    }

    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), Error> {
        if self.compressed {
            return Err(Error::InvalidState);
        }
        self.emit(Written::CompressionEnabled(level))?;
        self.compressed = true;
        Ok(())
    }

    fn channel_binding_bytes(&self, binding: ChannelBindingType) -> Option<Vec<u8>> {
        match binding {
            ChannelBindingType::TlsExporter if self.secured => self.channel_binding.clone(),
            _ => None,
        }
    }

    fn is_secured(&self) -> bool {
        self.secured
    }

    fn is_compressed(&self) -> bool {
        self.compressed
    }

    async fn close(&mut self) -> Result<(), Error> {
        if !self.closed {
            let _ = self.outbound.send(Written::Closed);
            self.closed = true;
            self.inbound.close();
        }
        Ok(())
    }
}

impl MockPeer {
    /// Hand a packet to the transport, as if it had been read from the wire.
    ///
    /// Returns `false` if the transport is gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.inbound.send(packet).is_ok()
    }

    /// Shorthand for sending a [`Packet::Stanza`].
    pub fn send_element(&self, elem: Element) -> bool {
        self.send(Packet::Stanza(elem))
    }

    /// Parse `xml` and send it as a stanza.
    pub fn send_xml(&self, xml: &str) -> Result<(), Error> {
        let elem: Element = xml.parse()?;
        if self.send_element(elem) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    /// Wait for the next write of any kind. `None` once the transport is
    /// dropped.
    pub async fn next_written(&mut self) -> Option<Written> {
        self.outbound.recv().await
    }

    /// Wait for the next complete element written, skipping raw strings and
    /// opening tags. `None` if the transport is closed first.
    pub async fn next_element(&mut self) -> Option<Element> {
        loop {
            match self.outbound.recv().await? {
                Written::Element(elem) => return Some(elem),
                Written::Closed => return None,
                Written::Raw(_)
                | Written::OpenTag(_)
                | Written::TlsStarted
                | Written::CompressionEnabled(_) => (),
            }
        }
    }

    /// Wait until the transport is closed, returning every element written
    /// in the meantime.
    pub async fn wait_closed(&mut self) -> Vec<Element> {
        let mut elements = Vec::new();
        while let Some(written) = self.outbound.recv().await {
            match written {
                Written::Element(elem) => elements.push(elem),
                Written::Closed => break,
                _ => (),
            }
        }
        elements
    }

    /// Whatever has been written and not yet consumed, without waiting.
    pub fn drain(&mut self) -> Vec<Written> {
        let mut written = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            written.push(item);
        }
        written
    }
}

use futures::{sink::SinkExt, stream::StreamExt};
use minidom::Element;
use tokio_rustls::{
    rustls::{ProtocolVersion, ServerConnection},
    TlsAcceptor,
};
use tokio_util::codec::{Framed, FramedParts};

use super::{AsyncReadAndWrite, ChannelBindingType, Transport};
use crate::config::CompressionLevel;
use crate::error::{Error, ProtocolError};
use crate::ns;
use crate::proto::{open_tag, Packet, XmppCodec};

type BoxedIo = Box<dyn AsyncReadAndWrite + 'static>;

/// [`Transport`] over a socket, or any other byte stream.
pub struct SocketTransport {
    /// `None` once closed.
    framed: Option<Framed<BoxedIo, XmppCodec>>,
    secured: bool,
    /// RFC 9266 keying material, exported right after the handshake.
    tls_exporter: Option<Vec<u8>>,
}

impl SocketTransport {
    /// Wrap `io`, refusing incoming elements larger than `max_stanza_size`
    /// bytes.
    pub fn new<S: AsyncReadAndWrite + 'static>(io: S, max_stanza_size: usize) -> Self {
        let io: BoxedIo = Box::new(io);
        SocketTransport {
            framed: Some(Framed::new(
                io,
                XmppCodec::new(ns::JABBER_CLIENT, max_stanza_size),
            )),
            secured: false,
            tls_exporter: None,
        }
    }

    fn framed(&mut self) -> Result<&mut Framed<BoxedIo, XmppCodec>, Error> {
        self.framed.as_mut().ok_or(Error::Disconnected)
    }

    async fn send(&mut self, packet: Packet) -> Result<(), Error> {
        self.framed()?.send(packet).await
    }
}

fn export_channel_binding(connection: &ServerConnection) -> Option<Vec<u8>> {
    if connection.protocol_version() != Some(ProtocolVersion::TLSv1_3) {
        return None;
    }
    match connection.export_keying_material(vec![0u8; 32], b"EXPORTER-Channel-Binding", None) {
        Ok(data) => Some(data),
        Err(e) => {
            log::warn!("failed to export tls-exporter channel binding: {}", e);
            None
        }
    }
}

impl Transport for SocketTransport {
    async fn read_element(&mut self) -> Result<Packet, Error> {
        match self.framed()?.next().await {
            Some(result) => result,
            None => Err(Error::Disconnected),
        }
    }

    async fn write_string(&mut self, raw: &str) -> Result<(), Error> {
        self.send(Packet::Text(raw.to_owned())).await
    }

    async fn write_element(&mut self, elem: &Element, include_closing: bool) -> Result<(), Error> {
        let packet = if include_closing {
            Packet::Stanza(elem.clone())
        } else {
            Packet::Text(open_tag(elem, ns::JABBER_CLIENT))
        };
        self.send(packet).await
    }

    async fn start_tls(&mut self, acceptor: TlsAcceptor) -> Result<(), Error> {
        if self.secured {
            debug_assert!(false, "STARTTLS on an already secured transport");
            return Err(Error::InvalidState);
        }
        {
            let framed = self.framed()?;
            // Anything received after the STARTTLS request was sent before
            // <proceed/> and must not end up inside the secured stream.
            if framed.codec().has_buffered() || !framed.read_buffer().is_empty() {
                return Err(ProtocolError::DataBeforeUpgrade.into());
            }
        }
        let framed = self.framed.take().ok_or(Error::Disconnected)?;
        let parts = framed.into_parts();

        let tls_stream = acceptor.accept(parts.io).await?;
        let (_, connection) = tls_stream.get_ref();
        self.tls_exporter = export_channel_binding(connection);
        log::debug!(
            "TLS established ({:?})",
            connection.protocol_version()
        );

        let io: BoxedIo = Box::new(tls_stream);
        let mut new_parts = FramedParts::new::<Packet>(io, parts.codec);
        new_parts.write_buf = parts.write_buf;
        self.framed = Some(Framed::from_parts(new_parts));
        self.secured = true;
        Ok(())
    }

    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), Error> {
        self.framed()?.codec_mut().enable_compression(level)
    }

    fn channel_binding_bytes(&self, binding: ChannelBindingType) -> Option<Vec<u8>> {
        match binding {
            ChannelBindingType::TlsExporter => self.tls_exporter.clone(),
            ChannelBindingType::TlsUnique => None,
        }
    }

    fn is_secured(&self) -> bool {
        self.secured
    }

    fn is_compressed(&self) -> bool {
        self.framed
            .as_ref()
            .map(|framed| framed.codec().is_compressed())
            .unwrap_or(false)
    }

    async fn close(&mut self) -> Result<(), Error> {
        match self.framed.take() {
            Some(mut framed) => framed.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rcgen::CertifiedKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
    use tokio_rustls::TlsConnector;

    const HEADER: &[u8] = b"<?xml version='1.0'?><stream:stream to='jackal.im' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    #[tokio::test]
    async fn test_read_and_write_elements() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 1024);

        client.write_all(HEADER).await.unwrap();
        client
            .write_all(b"<iq type='get' id='p1'><ping xmlns='urn:xmpp:ping'/></iq>")
            .await
            .unwrap();

        match transport.read_element().await.unwrap() {
            Packet::StreamStart(header) => assert_eq!(header.to.as_deref(), Some("jackal.im")),
            other => panic!("unexpected packet: {:?}", other),
        }
        match transport.read_element().await.unwrap() {
            Packet::Stanza(el) => {
                assert!(el.is("iq", ns::JABBER_CLIENT));
                assert_eq!(el.attr("id"), Some("p1"));
            }
            other => panic!("unexpected packet: {:?}", other),
        }

        let header = Element::builder("stream", ns::STREAM)
            .attr("from", "jackal.im")
            .build();
        transport.write_element(&header, false).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(
            &buf[..n],
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='jackal.im'>"
        );

        transport.write_string("</stream:stream>").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"</stream:stream>");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 1024);

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.write_string(" ").await,
            Err(Error::Disconnected)
        ));
        assert!(matches!(
            transport.read_element().await,
            Err(Error::Disconnected)
        ));

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_hangup() {
        let (server, client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 1024);
        drop(client);
        assert!(matches!(
            transport.read_element().await,
            Err(Error::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_too_large_stanza() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 64);
        client.write_all(HEADER).await.unwrap();
        client.write_all(&[b'<'; 1]).await.unwrap();
        client.write_all(b"message><body>").await.unwrap();
        client.write_all(&[b'x'; 128]).await.unwrap();

        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::StreamStart(_))
        ));
        assert!(matches!(
            transport.read_element().await,
            Err(Error::TooLargeStanza)
        ));
    }

    #[tokio::test]
    async fn test_compression_both_ways() {
        let (server, client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 1024);
        // The client side speaks the same framing.
        let mut peer = Framed::new(client, XmppCodec::new(ns::JABBER_CLIENT, 1024));

        peer.send(Packet::Text(String::from_utf8(HEADER.to_vec()).unwrap()))
            .await
            .unwrap();
        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::StreamStart(_))
        ));
        transport
            .write_element(&Element::builder("stream", ns::STREAM).build(), false)
            .await
            .unwrap();
        assert!(matches!(
            peer.next().await,
            Some(Ok(Packet::StreamStart(_)))
        ));

        assert!(!transport.is_compressed());
        transport
            .enable_compression(CompressionLevel::Default)
            .unwrap();
        assert!(transport.is_compressed());
        assert!(matches!(
            transport.enable_compression(CompressionLevel::Default),
            Err(Error::InvalidState)
        ));
        peer.codec_mut()
            .enable_compression(CompressionLevel::Fast)
            .unwrap();

        peer.send(Packet::Stanza(
            Element::builder("presence", ns::JABBER_CLIENT).build(),
        ))
        .await
        .unwrap();
        match transport.read_element().await.unwrap() {
            Packet::Stanza(el) => assert!(el.is("presence", ns::JABBER_CLIENT)),
            other => panic!("unexpected packet: {:?}", other),
        }

        transport
            .write_element(&Element::builder("message", ns::JABBER_CLIENT).build(), true)
            .await
            .unwrap();
        match peer.next().await {
            Some(Ok(Packet::Stanza(el))) => assert!(el.is("message", ns::JABBER_CLIENT)),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_footer() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 1024);
        client.write_all(HEADER).await.unwrap();
        client
            .write_all(b"<presence/>\n</stream:stream>")
            .await
            .unwrap();

        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::StreamStart(_))
        ));
        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::Stanza(_))
        ));
        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::StreamEnd)
        ));
    }

    fn tls_pair() -> (TlsAcceptor, TlsConnector) {
        let CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![String::from("jackal.im")]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(cert.der().clone()).unwrap();
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (
            TlsAcceptor::from(Arc::new(server)),
            TlsConnector::from(Arc::new(client)),
        )
    }

    async fn read_starttls(transport: &mut SocketTransport) {
        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::StreamStart(_))
        ));
        match transport.read_element().await.unwrap() {
            Packet::Stanza(el) => assert!(el.is("starttls", ns::TLS)),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_tls() {
        let (acceptor, connector) = tls_pair();
        let (server, mut client) = tokio::io::duplex(16384);
        let mut transport = SocketTransport::new(server, 1024);

        client.write_all(HEADER).await.unwrap();
        client
            .write_all(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await
            .unwrap();
        read_starttls(&mut transport).await;

        let server_name = ServerName::try_from("jackal.im").unwrap();
        let (upgraded, tls_client) = tokio::join!(
            transport.start_tls(acceptor),
            connector.connect(server_name, client)
        );
        upgraded.unwrap();
        let mut tls_client = tls_client.unwrap();
        assert!(transport.is_secured());
        assert_eq!(
            transport
                .channel_binding_bytes(ChannelBindingType::TlsExporter)
                .map(|data| data.len()),
            Some(32)
        );

        // The restarted stream runs inside TLS.
        tls_client.write_all(HEADER).await.unwrap();
        tls_client.flush().await.unwrap();
        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::StreamStart(_))
        ));
        transport
            .write_element(&Element::builder("presence", ns::JABBER_CLIENT).build(), true)
            .await
            .unwrap();
        let mut buf = vec![0u8; 1024];
        let n = tls_client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("<presence"));
    }

    #[tokio::test]
    async fn test_start_tls_refuses_pipelined_plaintext() {
        let (acceptor, _) = tls_pair();
        let (server, mut client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 1024);

        client.write_all(HEADER).await.unwrap();
        client
            .write_all(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/><message to='juliet@jackal.im'><body>hi</body></message>")
            .await
            .unwrap();
        read_starttls(&mut transport).await;

        assert!(matches!(
            transport.start_tls(acceptor).await,
            Err(Error::Protocol(ProtocolError::DataBeforeUpgrade))
        ));
        assert!(!transport.is_secured());
    }

    #[tokio::test]
    async fn test_compression_refuses_pipelined_plaintext() {
        let (server, mut client) = tokio::io::duplex(4096);
        let mut transport = SocketTransport::new(server, 1024);

        client.write_all(HEADER).await.unwrap();
        client
            .write_all(b"<compress xmlns='http://jabber.org/protocol/compress'><method>zlib</method></compress><presence/>")
            .await
            .unwrap();
        assert!(matches!(
            transport.read_element().await,
            Ok(Packet::StreamStart(_))
        ));
        match transport.read_element().await.unwrap() {
            Packet::Stanza(el) => assert!(el.is("compress", ns::COMPRESS)),
            other => panic!("unexpected packet: {:?}", other),
        }

        assert!(matches!(
            transport.enable_compression(CompressionLevel::Default),
            Err(Error::Protocol(ProtocolError::DataBeforeUpgrade))
        ));
        assert!(!transport.is_compressed());
    }

    #[test]
    fn test_no_channel_binding_without_tls() {
        let (server, _client) = tokio::io::duplex(64);
        let transport = SocketTransport::new(server, 1024);
        assert!(!transport.is_secured());
        assert_eq!(
            transport.channel_binding_bytes(ChannelBindingType::TlsExporter),
            None
        );
        assert_eq!(
            transport.channel_binding_bytes(ChannelBindingType::TlsUnique),
            None
        );
    }
}

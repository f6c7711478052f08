//! XML stream parser for XMPP

use std::io;

use bytes::{Buf, BytesMut};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress};
use minidom::Element;
use quick_xml::errors::SyntaxError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio_util::codec::{Decoder, Encoder};

use super::{Packet, StreamHeader};
use crate::config::CompressionLevel;
use crate::error::{Error, ProtocolError};
use crate::ns;

const XML_DECLARATION: &str = "<?xml version='1.0'?>";
const STREAM_FOOTER: &str = "</stream:stream>";

/// A top-level construct found in the receive buffer, with the offset right
/// after it.
enum Frame {
    /// Whitespace, XML declaration, comment or processing instruction.
    Skip(usize),
    Header(StreamHeader, Vec<(String, String)>, usize),
    Element { start: usize, end: usize },
    Footer(usize),
}

/// Stateful encoder/decoder for a bytestream from/to XMPP `Packet`
pub struct XmppCodec {
    /// Default namespace declared on outgoing stream headers.
    stream_ns: &'static str,
    /// Ceiling on the size of a single incoming element.
    max_stanza_size: usize,
    /// Plain text received but not yet framed.
    buffer: BytesMut,
    /// Namespace declarations of the peer's stream header, which elements
    /// at the top level of the stream inherit.
    namespaces: Vec<(String, String)>,
    compression: Option<Zlib>,
}

impl XmppCodec {
    /// Constructor
    pub fn new(stream_ns: &'static str, max_stanza_size: usize) -> Self {
        XmppCodec {
            stream_ns,
            max_stanza_size,
            buffer: BytesMut::new(),
            namespaces: Vec::new(),
            compression: None,
        }
    }

    /// Compress everything written from now on, and inflate everything read.
    ///
    /// Refused while received data is still waiting to be framed: the peer
    /// must not send anything between its request and our `<compressed/>`.
    pub fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), Error> {
        if self.compression.is_some() {
            return Err(Error::InvalidState);
        }
        if self.has_buffered() {
            return Err(ProtocolError::DataBeforeUpgrade.into());
        }
        self.compression = Some(Zlib::new(level));
        Ok(())
    }

    /// Whether received bytes are waiting to be framed.
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Whether compression has been enabled.
    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    fn parse_element(&self, raw: &[u8]) -> Result<Element, Error> {
        let raw = std::str::from_utf8(raw)?;
        // Top-level elements rely on the declarations of the stream header,
        // so parse them inside a copy of it.
        let mut document = String::with_capacity(raw.len() + 128);
        document.push_str("<stream:stream");
        for (name, value) in &self.namespaces {
            document.push_str(&format!(" {}='{}'", name, escape(value.as_str())));
        }
        if !self.namespaces.iter().any(|(name, _)| name == "xmlns") {
            document.push_str(&format!(" xmlns='{}'", self.stream_ns));
        }
        if !self.namespaces.iter().any(|(name, _)| name == "xmlns:stream") {
            document.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
        }
        document.push('>');
        document.push_str(raw);
        document.push_str(STREAM_FOOTER);

        let root: Element = document.parse()?;
        root.children()
            .next()
            .cloned()
            .ok_or(ProtocolError::InvalidStanza("empty element").into())
    }
}

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            match self.compression.as_mut() {
                Some(zlib) => zlib.inflate(&src[..], &mut self.buffer)?,
                None => self.buffer.extend_from_slice(&src[..]),
            }
            src.clear();
        }

        loop {
            let frame = match scan(&self.buffer, self.max_stanza_size)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match frame {
                Frame::Skip(end) => self.buffer.advance(end),
                Frame::Header(header, namespaces, end) => {
                    self.buffer.advance(end);
                    log::trace!("RECV stream header: {:?}", header);
                    self.namespaces = namespaces;
                    return Ok(Some(Packet::StreamStart(header)));
                }
                Frame::Element { start, end } => {
                    let element = self.parse_element(&self.buffer[start..end]);
                    self.buffer.advance(end);
                    let element = element?;
                    log::trace!("RECV: {:?}", element);
                    return Ok(Some(Packet::Stanza(element)));
                }
                Frame::Footer(end) => {
                    self.buffer.advance(end);
                    log::trace!("RECV stream footer");
                    return Ok(Some(Packet::StreamEnd));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if self.buffer.iter().all(u8::is_ascii_whitespace) => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of an element",
            )
            .into()),
        }
    }
}

impl Encoder<Packet> for XmppCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut buf = Vec::new();
        match item {
            Packet::StreamStart(header) => {
                buf.extend_from_slice(XML_DECLARATION.as_bytes());
                buf.extend_from_slice(open_tag(&header.to_element(), self.stream_ns).as_bytes());
            }
            Packet::Stanza(stanza) => stanza.write_to(&mut buf)?,
            Packet::Text(text) => buf.extend_from_slice(text.as_bytes()),
            Packet::StreamEnd => buf.extend_from_slice(STREAM_FOOTER.as_bytes()),
        }
        log::trace!("SEND: {}", String::from_utf8_lossy(&buf));

        match self.compression.as_mut() {
            Some(zlib) => zlib.deflate(&buf, dst)?,
            None => dst.extend_from_slice(&buf),
        }
        Ok(())
    }
}

/// Serialise the opening tag of `elem`, leaving it open.
///
/// Elements in the stream namespace get the `stream:` prefix along with the
/// declarations a stream header needs.
pub(crate) fn open_tag(elem: &Element, default_ns: &str) -> String {
    let mut tag = String::from("<");
    if elem.ns() == ns::STREAM {
        tag.push_str("stream:");
        tag.push_str(elem.name());
        tag.push_str(&format!(
            " xmlns='{}' xmlns:stream='{}'",
            escape(default_ns),
            ns::STREAM
        ));
    } else {
        tag.push_str(elem.name());
        tag.push_str(&format!(" xmlns='{}'", escape(elem.ns().as_str())));
    }
    for (name, value) in elem.attrs() {
        tag.push_str(&format!(" {}='{}'", name, escape(value)));
    }
    tag.push('>');
    tag
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream"
}

fn header_from_tag(tag: &BytesStart) -> (StreamHeader, Vec<(String, String)>) {
    let mut header = StreamHeader::default();
    let mut namespaces = Vec::new();
    for attr in tag.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        match key.as_str() {
            "from" => header.from = Some(value),
            "to" => header.to = Some(value),
            "id" => header.id = Some(value),
            "version" => header.version = Some(value),
            "xml:lang" => header.lang = Some(value),
            "xmlns" => {
                header.default_ns = Some(value.clone());
                namespaces.push((key, value));
            }
            _ if key.starts_with("xmlns:") => namespaces.push((key, value)),
            _ => (),
        }
    }
    (header, namespaces)
}

/// Find the next top-level construct in `buf`.
///
/// Returns `None` if more data is needed.
fn scan(buf: &[u8], max_stanza_size: usize) -> Result<Option<Frame>, Error> {
    let mut reader = Reader::from_reader(buf);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;
    // The footer closes the header we framed on an earlier call.
    reader.config_mut().allow_unmatched_ends = true;

    let mut depth = 0usize;
    let mut start = 0usize;

    loop {
        let pos = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            // Every other syntax error means the buffer ended inside a
            // construct.
            Err(quick_xml::Error::Syntax(e)) if !matches!(e, SyntaxError::InvalidBangMarkup) => {
                return incomplete(buf, depth, start, max_stanza_size)
            }
            Err(e) => return Err(e.into()),
        };
        let end = reader.buffer_position() as usize;

        match event {
            Event::Eof => return incomplete(buf, depth, start, max_stanza_size),
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_)
                if depth == 0 =>
            {
                return Ok(Some(Frame::Skip(end)))
            }
            Event::Text(text) if depth == 0 => {
                if text.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Some(Frame::Skip(end)));
                }
                return Err(ProtocolError::UnexpectedText.into());
            }
            Event::CData(_) if depth == 0 => return Err(ProtocolError::UnexpectedText.into()),
            Event::Start(tag) if depth == 0 && is_stream_tag(tag.name().as_ref()) => {
                let (header, namespaces) = header_from_tag(&tag);
                return Ok(Some(Frame::Header(header, namespaces, end)));
            }
            Event::End(tag) if depth == 0 => {
                if is_stream_tag(tag.name().as_ref()) {
                    return Ok(Some(Frame::Footer(end)));
                }
                return Err(ProtocolError::UnbalancedTag.into());
            }
            Event::Empty(_) if depth == 0 => {
                check_size(end - pos, max_stanza_size)?;
                return Ok(Some(Frame::Element { start: pos, end }));
            }
            Event::Start(_) => {
                if depth == 0 {
                    start = pos;
                }
                depth += 1;
            }
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    check_size(end - start, max_stanza_size)?;
                    return Ok(Some(Frame::Element { start, end }));
                }
            }
            _ => (),
        }

        if depth > 0 {
            check_size(end - start, max_stanza_size)?;
        }
    }
}

fn incomplete(
    buf: &[u8],
    depth: usize,
    start: usize,
    max_stanza_size: usize,
) -> Result<Option<Frame>, Error> {
    let pending = if depth > 0 { buf.len() - start } else { buf.len() };
    check_size(pending, max_stanza_size)?;
    Ok(None)
}

fn check_size(size: usize, max_stanza_size: usize) -> Result<(), Error> {
    if size > max_stanza_size {
        return Err(Error::TooLargeStanza);
    }
    Ok(())
}

/// XEP-0138 `zlib` method, flushed at every write so that each stanza can be
/// inflated as soon as it has been received.
struct Zlib {
    deflate: Compress,
    inflate: Decompress,
}

impl Zlib {
    fn new(level: CompressionLevel) -> Self {
        Zlib {
            deflate: Compress::new(level.into(), true),
            inflate: Decompress::new(true),
        }
    }

    fn inflate(&mut self, mut input: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            let total_in = self.inflate.total_in();
            let total_out = self.inflate.total_out();
            self.inflate
                .decompress(input, &mut chunk, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let read = (self.inflate.total_in() - total_in) as usize;
            let written = (self.inflate.total_out() - total_out) as usize;
            out.extend_from_slice(&chunk[..written]);
            input = &input[read..];
            if written < chunk.len() && (input.is_empty() || read == 0) {
                return Ok(());
            }
        }
    }

    fn deflate(&mut self, mut input: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            let total_in = self.deflate.total_in();
            let total_out = self.deflate.total_out();
            self.deflate
                .compress(input, &mut chunk, FlushCompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let read = (self.deflate.total_in() - total_in) as usize;
            let written = (self.deflate.total_out() - total_out) as usize;
            out.extend_from_slice(&chunk[..written]);
            input = &input[read..];
            if input.is_empty() && written < chunk.len() {
                return Ok(());
            }
        }
    }
}

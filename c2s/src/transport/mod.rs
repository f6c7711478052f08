//! # Element-level transports
//!
//! A [`Transport`] owns one byte channel and exchanges whole elements over
//! it. It can be upgraded in place to TLS and to zlib compression, in either
//! order, without the caller changing the way it reads and writes.
//!
//! [`SocketTransport`] is the implementation for real connections;
//! [`mock::MockTransport`] exchanges [`Packet`]s over in-memory queues and is
//! what the stream tests drive.

use core::future::Future;

use minidom::Element;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::config::CompressionLevel;
use crate::error::Error;
use crate::proto::Packet;

pub mod mock;
mod socket;

pub use socket::SocketTransport;

/// Trait alias for the I/O objects a [`SocketTransport`] can run on.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// Kinds of channel binding data a secured transport may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBindingType {
    /// RFC 5929 `tls-unique`. Not available with rustls.
    TlsUnique,
    /// RFC 9266 `tls-exporter`, available on TLS 1.3 connections.
    TlsExporter,
}

/// An element-level view of one client connection.
pub trait Transport: Send {
    /// Wait for the next complete top-level construct sent by the peer.
    ///
    /// Fails with [`Error::TooLargeStanza`] when an element exceeds the size
    /// ceiling, and with [`Error::Disconnected`] once the channel is closed.
    ///
    /// Cancel safe: dropping the future before completion loses no data.
    fn read_element(&mut self) -> impl Future<Output = Result<Packet, Error>> + Send;

    /// Write `raw` as is and flush it.
    fn write_string(&mut self, raw: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Serialise `elem` and flush it.
    ///
    /// With `include_closing` unset, only the opening tag is written; this is
    /// how the `<stream:stream>` header goes out.
    fn write_element(
        &mut self,
        elem: &Element,
        include_closing: bool,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Perform the server side of a TLS handshake on the channel.
    ///
    /// Calling this on an already secured transport is an error.
    fn start_tls(&mut self, acceptor: TlsAcceptor)
        -> impl Future<Output = Result<(), Error>> + Send;

    /// Compress all further writes and inflate all further reads.
    ///
    /// Calling this on an already compressed transport is an error.
    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), Error>;

    /// Channel binding data of the given type, if the transport is secured
    /// and able to provide it.
    fn channel_binding_bytes(&self, binding: ChannelBindingType) -> Option<Vec<u8>>;

    /// Whether TLS is active.
    fn is_secured(&self) -> bool;

    /// Whether compression is active.
    fn is_compressed(&self) -> bool;

    /// Shut the channel down. Idempotent; every other operation fails with
    /// [`Error::Disconnected`] afterwards.
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

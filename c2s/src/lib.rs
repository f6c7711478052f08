//! Server side of [XMPP](https://xmpp.org/) client-to-server connections, with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! This crate holds the per-connection machinery of a server: a [`Transport`]
//! turning a byte channel into whole XML elements, the [`Stream`] state
//! machine negotiating TLS, compression, SASL and resource binding, and the
//! [`IqModule`] contract through which feature modules such as
//! [`module::ping::Ping`] handle IQ stanzas once the stream is bound.
//!
//! # Getting started
//!
//! In most cases, you want to start with a [`Server`] listening on a TCP
//! socket, given a [`StreamConfig`], an [`auth::Authenticator`] and a factory
//! building the modules of each stream.
//!
//! # Features
//!
//! Supported stream features:
//! - [x] STARTTLS (with rustls)
//! - [x] SASL, with channel binding material for `tls-exporter`
//! - [x] Stream compression (XEP-0138, zlib)
//! - [x] Resource binding and legacy session establishment
//! - [ ] Stream management
//!
//! Supported modules:
//! - [x] XMPP Ping (XEP-0199)

#![deny(unsafe_code, missing_docs, bare_trait_objects)]

pub mod auth;
mod config;
pub use config::{CompressionLevel, PingConfig, StreamConfig};
mod event;
pub use event::Event;
pub mod module;
pub use module::{IqModule, Modules};
pub mod ns;
pub mod proto;
mod server;
pub use server::{ModuleFactory, Server};
pub mod stanza;
pub mod stream;
pub use stream::{Stream, StreamHandle, StreamState};
pub mod stream_error;
pub mod transport;
pub use transport::Transport;

/// Detailed error types
pub mod error;

#[doc(inline)]
/// Generic xmpp-c2s Error
pub use crate::error::Error;

// Re-exports
pub use jid;
pub use minidom;
pub use xmpp_parsers;
pub use tokio_rustls::rustls;

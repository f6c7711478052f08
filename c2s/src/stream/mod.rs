//! # Client streams
//!
//! A [`Stream`] owns one [`Transport`] and takes the client from the TCP
//! connection to a bound resource:
//!
//! ```text
//! Connecting --header--> Connected --SASL--> Authenticated --bind--> Bound
//!      \                    |  ^                 |  ^                  |
//!       \                   '--' STARTTLS        '--' compression      |
//!        '---------------------------+-------------+-------------------'
//!                                    v
//!                               Disconnected
//! ```
//!
//! States only ever advance. Once bound, IQs are dispatched to the stream's
//! [`Modules`], and modules write back through a [`StreamHandle`]. All
//! writes of a bound stream are funnelled through the handle's queue, so
//! replies go out in the order they were produced.

use std::sync::Arc;

use jid::{FullJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use tokio::time::Instant;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::stanza_error::DefinedCondition;

use crate::auth::{Authenticator, SaslMechanism};
use crate::config::StreamConfig;
use crate::error::{Error, ProtocolError};
use crate::event::Event;
use crate::module::{IqModule, Modules};
use crate::ns;
use crate::proto::{make_id, Packet, StreamHeader};
use crate::stanza;
use crate::stream_error::StreamError;
use crate::transport::Transport;

mod handle;
pub mod mock;
mod negotiation;

pub(crate) use handle::StreamCommand;
pub use handle::StreamHandle;

/// Negotiation progress of a [`Stream`].
///
/// Ordered: a stream only moves to greater states, and
/// [`Disconnected`][`Self::Disconnected`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    /// Waiting for the client's stream header.
    Connecting,
    /// Negotiating TLS and authentication.
    Connected,
    /// Authenticated, negotiating compression and resource binding.
    Authenticated,
    /// Resource bound, routing stanzas.
    Bound,
    /// Gone.
    Disconnected,
}

/// One client-to-server stream.
pub struct Stream<T: Transport> {
    transport: T,
    config: Arc<StreamConfig>,
    authenticator: Arc<dyn Authenticator>,
    state: StreamState,
    id: String,

    /// A new stream header is due after TLS, SASL or compression.
    restart: bool,
    header_sent: bool,

    /// Mechanism waiting for the next `<response/>`.
    sasl: Option<Box<dyn SaslMechanism>>,
    username: Option<String>,
    jid: Option<FullJid>,

    handle: StreamHandle,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
    modules: Modules,
    events: Option<mpsc::UnboundedSender<Event>>,
}

impl<T: Transport> Stream<T> {
    /// Create a stream over `transport`.
    ///
    /// `modules` builds the module set of the stream, in dispatch order,
    /// given the handle the modules write through.
    pub fn new<F>(
        transport: T,
        config: Arc<StreamConfig>,
        authenticator: Arc<dyn Authenticator>,
        modules: F,
    ) -> Self
    where
        F: FnOnce(&StreamHandle) -> Vec<Box<dyn IqModule>>,
    {
        let (handle, commands) = StreamHandle::new(config.domain.clone(), None);
        let modules = Modules::new(modules(&handle));
        Stream {
            transport,
            config,
            authenticator,
            state: StreamState::Connecting,
            id: make_id(),
            restart: false,
            header_sent: false,
            sasl: None,
            username: None,
            jid: None,
            handle,
            commands,
            modules,
            events: None,
        }
    }

    /// Report [`Event`]s of this stream to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Handle to this stream.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Drive the stream until it is gone.
    ///
    /// Returns `Ok(())` if the client closed the stream, and the error which
    /// terminated it otherwise; a disconnect requested through a
    /// [`StreamHandle`] is reported as [`Error::Stream`].
    pub async fn run(mut self) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.negotiation_timeout;
        let result = self.drive(deadline).await;
        self.teardown(&result).await;
        result
    }

    async fn drive(&mut self, deadline: Instant) -> Result<(), Error> {
        loop {
            let negotiating = self.state < StreamState::Bound;
            tokio::select! {
                biased;
                Some(command) = self.commands.recv() => match command {
                    StreamCommand::Send(elem) => self.transport.write_element(&elem, true).await?,
                    StreamCommand::Disconnect(reason) => {
                        log::debug!("Stream {} disconnect requested: {}", self.id, reason);
                        return Err(Error::Stream(reason));
                    }
                },
                packet = self.transport.read_element() => match packet? {
                    Packet::StreamStart(header) => self.handle_header(header).await?,
                    Packet::Stanza(elem) => self.handle_element(elem).await?,
                    Packet::Text(_) => return Err(ProtocolError::UnexpectedText.into()),
                    Packet::StreamEnd => {
                        log::debug!("Stream {} closed by peer", self.id);
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep_until(deadline), if negotiating => {
                    log::info!("Stream {} not bound in time, giving up", self.id);
                    return Err(StreamError::ConnectionTimeout.into());
                }
            }
        }
    }

    fn advance(&mut self, state: StreamState) {
        debug_assert!(state > self.state, "{:?} -> {:?}", self.state, state);
        log::debug!("Stream {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                log::trace!("Stream {}: event receiver gone", self.id);
            }
        }
    }

    async fn handle_element(&mut self, elem: Element) -> Result<(), Error> {
        if self.restart {
            log::info!("Stream {}: expected stream restart, got {}", self.id, elem.name());
            return Err(ProtocolError::InvalidStreamStart.into());
        }
        match self.state {
            StreamState::Connecting => Err(ProtocolError::InvalidStreamStart.into()),
            StreamState::Connected => self.handle_unauthenticated(elem).await,
            StreamState::Authenticated => self.handle_authenticated(elem).await,
            StreamState::Bound => self.route(elem),
            StreamState::Disconnected => Err(Error::InvalidState),
        }
    }

    fn route(&mut self, mut elem: Element) -> Result<(), Error> {
        self.modules.on_activity();
        let jid = self.jid.clone().ok_or(Error::InvalidState)?;

        if elem.is("iq", ns::JABBER_CLIENT) {
            let mut iq = match stanza::parse_iq(elem) {
                Ok(iq) => iq,
                Err(reply) => {
                    if let Some(reply) = reply {
                        self.handle.send_element(reply)?;
                    }
                    return Ok(());
                }
            };
            iq.from = Some(Jid::from(jid));
            self.route_iq(iq)
        } else if elem.is("message", ns::JABBER_CLIENT) || elem.is("presence", ns::JABBER_CLIENT)
        {
            elem.set_attr("from", jid.to_string());
            self.emit(Event::Stanza(elem));
            Ok(())
        } else {
            log::info!(
                "Stream {}: unsupported stanza {{{}}}{}",
                self.id,
                elem.ns(),
                elem.name()
            );
            Err(StreamError::UnsupportedStanzaType.into())
        }
    }

    fn route_iq(&mut self, iq: Iq) -> Result<(), Error> {
        if let IqType::Set(payload) = &iq.payload {
            if payload.is("session", ns::SESSION) {
                return self.handle.send_element(stanza::result_reply(&iq, None).into());
            }
        }
        match self.modules.dispatch(iq) {
            Ok(()) => Ok(()),
            Err(iq) if stanza::is_request(&iq) => {
                log::debug!("Stream {}: no module for iq {}", self.id, iq.id);
                let reply = stanza::error_reply(&iq, DefinedCondition::ServiceUnavailable);
                self.handle.send_element(reply.into())
            }
            Err(iq) => {
                log::debug!("Stream {}: dropping unclaimed response {}", self.id, iq.id);
                Ok(())
            }
        }
    }

    async fn teardown(&mut self, result: &Result<(), Error>) {
        self.advance(StreamState::Disconnected);
        self.modules.done();

        let reason = match result {
            Ok(()) => None,
            Err(e) => {
                log::info!("Stream {} terminated: {}", self.id, e);
                e.stream_condition()
            }
        };

        if let Some(reason) = reason {
            if !self.header_sent {
                if let Err(e) = self.send_header().await {
                    log::debug!("Stream {}: failed to send header: {}", self.id, e);
                }
            }
            if self.header_sent {
                if let Err(e) = self.transport.write_element(&reason.into(), true).await {
                    log::debug!("Stream {}: failed to send stream error: {}", self.id, e);
                }
            }
        }
        if self.header_sent {
            if let Err(e) = self.transport.write_string("</stream:stream>").await {
                log::trace!("Stream {}: failed to send footer: {}", self.id, e);
            }
        }
        if let Err(e) = self.transport.close().await {
            log::debug!("Stream {}: close failed: {}", self.id, e);
        }

        self.emit(Event::Disconnected { reason });
    }

    async fn send_header(&mut self) -> Result<(), Error> {
        let header = StreamHeader {
            from: Some(self.config.domain.clone()),
            to: None,
            id: Some(self.id.clone()),
            version: Some(String::from("1.0")),
            lang: Some(String::from("en")),
            default_ns: None,
        };
        self.transport.write_string("<?xml version='1.0'?>").await?;
        self.transport
            .write_element(&header.to_element(), false)
            .await?;
        self.header_sent = true;
        Ok(())
    }
}

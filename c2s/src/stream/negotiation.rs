use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use jid::FullJid;
use minidom::{Element, Node};
use sasl::common::ChannelBinding;
use xmpp_parsers::bind::BindQuery;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::sasl::{Abort, Challenge, Failure, Response, Success};
use xmpp_parsers::stanza_error::DefinedCondition;
use xmpp_parsers::starttls::{Proceed, Request};

use super::{Stream, StreamState};
use crate::auth::{SaslDefinedCondition, SaslMechanism, SaslResponse};
use crate::error::{Error, ProtocolError};
use crate::event::Event;
use crate::ns;
use crate::proto::{make_id, StreamHeader};
use crate::stanza;
use crate::stream_error::StreamError;
use crate::transport::{ChannelBindingType, Transport};

/// Initial response of an `<auth/>`.
///
/// Read by hand rather than through [`xmpp_parsers::sasl::Auth`], whose
/// mechanism attribute only admits the mechanisms it knows about.
fn initial_response(elem: &Element) -> Result<Vec<u8>, SaslDefinedCondition> {
    let text = elem.text();
    let text = text.trim();
    // A lone "=" is an explicitly empty response.
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    Base64
        .decode(text)
        .map_err(|_| SaslDefinedCondition::IncorrectEncoding)
}

fn response_data(elem: Element) -> Result<Vec<u8>, SaslDefinedCondition> {
    if elem.text().trim() == "=" {
        return Ok(Vec::new());
    }
    Response::try_from(elem)
        .map(|response| response.data)
        .map_err(|_| SaslDefinedCondition::IncorrectEncoding)
}

impl<T: Transport> Stream<T> {
    pub(super) async fn handle_header(&mut self, header: StreamHeader) -> Result<(), Error> {
        if self.state != StreamState::Connecting && !self.restart {
            log::info!("Stream {}: unexpected stream header", self.id);
            return Err(ProtocolError::InvalidStreamStart.into());
        }
        self.restart = false;
        if self.header_sent {
            self.id = make_id();
        }
        // Our header goes out before any validation, so that errors can be
        // reported on a well-formed stream.
        self.send_header().await?;

        if header.default_ns.as_deref() != Some(ns::JABBER_CLIENT) {
            return Err(StreamError::InvalidNamespace.into());
        }
        if !header.is_version_1() {
            return Err(StreamError::UnsupportedVersion.into());
        }
        match header.to.as_deref() {
            Some(to) if to.eq_ignore_ascii_case(&self.config.domain) => (),
            to => {
                log::info!("Stream {}: header for unknown host {:?}", self.id, to);
                return Err(StreamError::HostUnknown.into());
            }
        }

        if self.state == StreamState::Connecting {
            self.advance(StreamState::Connected);
        }
        self.send_features().await
    }

    async fn send_features(&mut self) -> Result<(), Error> {
        let secured = self.transport.is_secured();
        let mut features = Element::builder("features", ns::STREAM).build();
        match self.state {
            StreamState::Connected => {
                let tls_pending = self.config.tls.is_some() && !secured;
                if tls_pending {
                    let mut starttls = Element::builder("starttls", ns::TLS).build();
                    if self.config.tls_required {
                        starttls.append_child(Element::builder("required", ns::TLS).build());
                    }
                    features.append_child(starttls);
                }
                if !(tls_pending && self.config.tls_required) {
                    let mut mechanisms = Element::builder("mechanisms", ns::SASL).build();
                    for name in self.authenticator.mechanisms(secured) {
                        let mut mechanism = Element::builder("mechanism", ns::SASL).build();
                        mechanism.append_node(Node::Text(name));
                        mechanisms.append_child(mechanism);
                    }
                    if mechanisms.children().next().is_some() {
                        features.append_child(mechanisms);
                    }
                }
            }
            StreamState::Authenticated => {
                if self.config.compression.is_some() && !self.transport.is_compressed() {
                    let mut method = Element::builder("method", ns::COMPRESS_FEATURE).build();
                    method.append_node(Node::Text(String::from("zlib")));
                    let mut compression =
                        Element::builder("compression", ns::COMPRESS_FEATURE).build();
                    compression.append_child(method);
                    features.append_child(compression);
                }
                features.append_child(Element::builder("bind", ns::BIND).build());
                let mut session = Element::builder("session", ns::SESSION).build();
                session.append_child(Element::builder("optional", ns::SESSION).build());
                features.append_child(session);
            }
            _ => return Err(Error::InvalidState),
        }
        self.transport.write_element(&features, true).await
    }

    pub(super) async fn handle_unauthenticated(&mut self, elem: Element) -> Result<(), Error> {
        if elem.is("starttls", ns::TLS) {
            self.handle_starttls(elem).await
        } else if elem.ns() == ns::SASL {
            self.handle_sasl(elem).await
        } else {
            log::info!(
                "Stream {}: {} before authentication",
                self.id,
                elem.name()
            );
            Err(StreamError::NotAuthorized.into())
        }
    }

    async fn handle_starttls(&mut self, elem: Element) -> Result<(), Error> {
        if let Err(e) = Request::try_from(elem) {
            log::info!("Stream {}: invalid STARTTLS request: {}", self.id, e);
            return Err(StreamError::BadFormat.into());
        }
        let acceptor = match &self.config.tls {
            Some(acceptor) if !self.transport.is_secured() => acceptor.clone(),
            _ => {
                self.transport
                    .write_element(&Element::builder("failure", ns::TLS).build(), true)
                    .await?;
                return Err(ProtocolError::NoTls.into());
            }
        };
        self.transport
            .write_element(&Proceed.into(), true)
            .await?;
        self.transport.start_tls(acceptor).await?;
        log::debug!("Stream {}: TLS negotiated", self.id);
        self.restart = true;
        Ok(())
    }

    async fn handle_sasl(&mut self, elem: Element) -> Result<(), Error> {
        let result = if elem.is("auth", ns::SASL) {
            self.sasl_auth(&elem)
        } else if elem.is("response", ns::SASL) {
            self.sasl_response(elem)
        } else if elem.is("abort", ns::SASL) {
            self.sasl_abort(elem)
        } else {
            Err(SaslDefinedCondition::MalformedRequest)
        };
        match result {
            Ok(SaslResponse::Challenge(data)) => {
                self.transport
                    .write_element(&Challenge { data }.into(), true)
                    .await
            }
            Ok(SaslResponse::Success {
                username,
                additional_data,
            }) => {
                self.transport
                    .write_element(
                        &Success {
                            data: additional_data,
                        }
                        .into(),
                        true,
                    )
                    .await?;
                log::debug!("Stream {}: authenticated as {}", self.id, username);
                self.username = Some(username);
                self.advance(StreamState::Authenticated);
                self.restart = true;
                Ok(())
            }
            Err(defined_condition) => {
                self.sasl = None;
                log::info!("Stream {}: SASL failure: {:?}", self.id, defined_condition);
                let failure = Failure {
                    defined_condition,
                    texts: BTreeMap::new(),
                };
                self.transport.write_element(&failure.into(), true).await
            }
        }
    }

    fn sasl_auth(&mut self, elem: &Element) -> Result<SaslResponse, SaslDefinedCondition> {
        if self.sasl.is_some() {
            return Err(SaslDefinedCondition::MalformedRequest);
        }
        let secured = self.transport.is_secured();
        if self.config.tls_required && self.config.tls.is_some() && !secured {
            return Err(SaslDefinedCondition::EncryptionRequired);
        }
        let name = elem
            .attr("mechanism")
            .ok_or(SaslDefinedCondition::InvalidMechanism)?;
        let payload = initial_response(elem)?;
        let channel_binding = match self
            .transport
            .channel_binding_bytes(ChannelBindingType::TlsExporter)
        {
            Some(data) => ChannelBinding::TlsExporter(data),
            None => ChannelBinding::None,
        };
        let mechanism = self
            .authenticator
            .start(name, secured, channel_binding)
            .ok_or(SaslDefinedCondition::InvalidMechanism)?;
        self.sasl_step(mechanism, &payload)
    }

    fn sasl_response(&mut self, elem: Element) -> Result<SaslResponse, SaslDefinedCondition> {
        let mechanism = self
            .sasl
            .take()
            .ok_or(SaslDefinedCondition::MalformedRequest)?;
        let payload = response_data(elem)?;
        self.sasl_step(mechanism, &payload)
    }

    fn sasl_abort(&mut self, elem: Element) -> Result<SaslResponse, SaslDefinedCondition> {
        if let Some(mechanism) = self.sasl.take() {
            log::debug!("Stream {}: {} aborted", self.id, mechanism.name());
        }
        match Abort::try_from(elem) {
            Ok(_) => Err(SaslDefinedCondition::Aborted),
            Err(_) => Err(SaslDefinedCondition::MalformedRequest),
        }
    }

    /// Feed `payload` to `mechanism`, keeping it if it expects more.
    fn sasl_step(
        &mut self,
        mut mechanism: Box<dyn SaslMechanism>,
        payload: &[u8],
    ) -> Result<SaslResponse, SaslDefinedCondition> {
        match mechanism.respond(payload) {
            Ok(SaslResponse::Challenge(data)) => {
                log::trace!("Stream {}: {} challenge", self.id, mechanism.name());
                self.sasl = Some(mechanism);
                Ok(SaslResponse::Challenge(data))
            }
            Ok(success) => {
                log::debug!("Stream {}: {} succeeded", self.id, mechanism.name());
                Ok(success)
            }
            Err(failure) => {
                log::info!(
                    "Stream {}: {} failed: {:?}",
                    self.id,
                    mechanism.name(),
                    failure
                );
                Err(failure)
            }
        }
    }

    pub(super) async fn handle_authenticated(&mut self, elem: Element) -> Result<(), Error> {
        if elem.is("compress", ns::COMPRESS) {
            return self.handle_compress(&elem).await;
        }
        if elem.is("iq", ns::JABBER_CLIENT) {
            let iq = match stanza::parse_iq(elem) {
                Ok(iq) => iq,
                Err(Some(reply)) => return self.transport.write_element(&reply, true).await,
                Err(None) => return Err(StreamError::NotAuthorized.into()),
            };
            if let IqType::Set(payload) = &iq.payload {
                if payload.is("bind", ns::BIND) {
                    return self.handle_bind(iq).await;
                }
            }
            log::info!("Stream {}: iq {} before resource binding", self.id, iq.id);
        } else {
            log::info!(
                "Stream {}: {} before resource binding",
                self.id,
                elem.name()
            );
        }
        Err(StreamError::NotAuthorized.into())
    }

    async fn handle_compress(&mut self, elem: &Element) -> Result<(), Error> {
        let failure = |condition: &str| {
            let mut failure = Element::builder("failure", ns::COMPRESS).build();
            failure.append_child(Element::builder(condition, ns::COMPRESS).build());
            failure
        };
        let level = match self.config.compression {
            Some(level) if !self.transport.is_compressed() => level,
            _ => {
                return self
                    .transport
                    .write_element(&failure("setup-failed"), true)
                    .await;
            }
        };
        let method = elem
            .get_child("method", ns::COMPRESS)
            .map(|method| method.text());
        if method.as_deref() != Some("zlib") {
            log::info!("Stream {}: unsupported compression {:?}", self.id, method);
            return self
                .transport
                .write_element(&failure("unsupported-method"), true)
                .await;
        }

        self.transport
            .write_element(&Element::builder("compressed", ns::COMPRESS).build(), true)
            .await?;
        self.transport.enable_compression(level)?;
        log::debug!("Stream {}: compression enabled", self.id);
        self.restart = true;
        Ok(())
    }

    async fn handle_bind(&mut self, iq: Iq) -> Result<(), Error> {
        let username = self.username.clone().ok_or(Error::InvalidState)?;
        let IqType::Set(payload) = &iq.payload else {
            return Err(Error::InvalidState);
        };
        // BindQuery validates the request but keeps the resource to itself.
        if let Err(e) = BindQuery::try_from(payload.clone()) {
            log::info!("Stream {}: invalid bind request: {}", self.id, e);
            let reply = stanza::error_reply(&iq, DefinedCondition::BadRequest);
            return self.transport.write_element(&reply.into(), true).await;
        }
        let resource = payload
            .get_child("resource", ns::BIND)
            .map(|resource| resource.text())
            .filter(|resource| !resource.is_empty())
            .unwrap_or_else(make_id);

        let jid = match FullJid::new(&format!(
            "{}@{}/{}",
            username, self.config.domain, resource
        )) {
            Ok(jid) => jid,
            Err(e) => {
                log::info!("Stream {}: cannot bind {:?}: {}", self.id, resource, e);
                let reply = stanza::error_reply(&iq, DefinedCondition::BadRequest);
                return self.transport.write_element(&reply.into(), true).await;
            }
        };

        let mut jid_elem = Element::builder("jid", ns::BIND).build();
        jid_elem.append_node(Node::Text(jid.to_string()));
        let mut bind = Element::builder("bind", ns::BIND).build();
        bind.append_child(jid_elem);
        self.transport
            .write_element(&stanza::result_reply(&iq, Some(bind)).into(), true)
            .await?;

        log::debug!(
            "Stream {}: bound {}, modules: {:?}",
            self.id,
            jid,
            self.modules.namespaces()
        );
        self.handle.set_jid(jid.clone());
        self.jid = Some(jid.clone());
        self.advance(StreamState::Bound);
        self.modules.start();
        self.emit(Event::Online { bound_jid: jid });
        Ok(())
    }
}

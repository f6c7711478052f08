//! SASL authentication of client streams.
//!
//! The stream drives the RFC 6120 `<auth/>`, `<response/>` and `<abort/>`
//! exchange; an [`Authenticator`] decides which mechanisms are offered and
//! instantiates them. Checking credentials is left to whatever backs the
//! mechanism.

use std::sync::Arc;

use sasl::common::{ChannelBinding, Identity};
use sasl::secret;
use sasl::server::mechanisms::Plain;
use sasl::server::{Mechanism, MechanismError, Response, Validator, ValidatorError};
pub use xmpp_parsers::sasl::DefinedCondition as SaslDefinedCondition;

/// Result of one successful SASL step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslResponse {
    /// Send a challenge and wait for the next `<response/>`.
    Challenge(Vec<u8>),
    /// Authentication is complete.
    Success {
        /// Local part of the authenticated JID.
        username: String,
        /// Additional data sent along with `<success/>`.
        additional_data: Vec<u8>,
    },
}

/// Server side of one SASL mechanism exchange.
pub trait SaslMechanism: Send {
    /// Name of the mechanism, as advertised.
    fn name(&self) -> &str;

    /// Process the client's initial response or a later response.
    fn respond(&mut self, payload: &[u8]) -> Result<SaslResponse, SaslDefinedCondition>;
}

/// Chooses and instantiates the SASL mechanisms of a stream.
pub trait Authenticator: Send + Sync {
    /// Mechanisms to advertise, given whether the stream is secured.
    fn mechanisms(&self, secured: bool) -> Vec<String>;

    /// Start an exchange for `name`, or `None` if it is not offered.
    fn start(
        &self,
        name: &str,
        secured: bool,
        channel_binding: ChannelBinding,
    ) -> Option<Box<dyn SaslMechanism>>;
}

/// Server mechanisms of the `sasl` crate, such as its SCRAM implementations,
/// used as [`SaslMechanism`].
pub struct SaslServerMechanism<M>(pub M);

impl<M: Mechanism + Send> SaslMechanism for SaslServerMechanism<M> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn respond(&mut self, payload: &[u8]) -> Result<SaslResponse, SaslDefinedCondition> {
        match self.0.respond(payload) {
            Ok(Response::Proceed(data)) => Ok(SaslResponse::Challenge(data)),
            Ok(Response::Success(Identity::Username(username), additional_data)) => {
                Ok(SaslResponse::Success {
                    username,
                    additional_data,
                })
            }
            Ok(Response::Success(Identity::None, _)) => {
                log::info!("{} succeeded without an identity", self.0.name());
                Err(SaslDefinedCondition::NotAuthorized)
            }
            Err(e) => {
                log::info!("{} failed: {:?}", self.0.name(), e);
                Err(failure_condition(&e))
            }
        }
    }
}

fn failure_condition(e: &MechanismError) -> SaslDefinedCondition {
    match e {
        MechanismError::NoUsernameSpecified
        | MechanismError::ErrorDecodingUsername
        | MechanismError::NoPasswordSpecified
        | MechanismError::ErrorDecodingPassword
        | MechanismError::FailedToDecodeMessage => SaslDefinedCondition::MalformedRequest,
        _ => SaslDefinedCondition::NotAuthorized,
    }
}

/// Client-first mechanisms answer an `<auth/>` without initial response
/// with an empty challenge, asking for it.
struct ClientFirst<M> {
    mechanism: M,
    asked: bool,
}

impl<M: SaslMechanism> SaslMechanism for ClientFirst<M> {
    fn name(&self) -> &str {
        self.mechanism.name()
    }

    fn respond(&mut self, payload: &[u8]) -> Result<SaslResponse, SaslDefinedCondition> {
        if payload.is_empty() && !self.asked {
            self.asked = true;
            return Ok(SaslResponse::Challenge(Vec::new()));
        }
        self.asked = true;
        self.mechanism.respond(payload)
    }
}

type CredentialCheck = dyn Fn(&str, &str) -> bool + Send + Sync;

/// Checks `PLAIN` credentials with the callback of a [`PlainAuthenticator`].
struct CredentialValidator(Arc<CredentialCheck>);

impl Validator<secret::Plain> for CredentialValidator {
    fn validate(&self, identity: &Identity, value: &secret::Plain) -> Result<(), ValidatorError> {
        let username = match identity {
            Identity::Username(username) if !username.is_empty() => username,
            _ => return Err(ValidatorError::AuthenticationFailed),
        };
        if (self.0)(username, &value.0) {
            Ok(())
        } else {
            log::info!("PLAIN authentication failed for {}", username);
            Err(ValidatorError::AuthenticationFailed)
        }
    }
}

/// Offers `PLAIN`, checking username and password with a callback.
///
/// The exchange itself is the `sasl` crate's server `PLAIN`, which ignores
/// the authorization identity. `PLAIN` is only offered on secured streams
/// unless [`allow_insecure`][`Self::allow_insecure`] is set.
#[derive(Clone)]
pub struct PlainAuthenticator {
    check: Arc<CredentialCheck>,
    allow_insecure: bool,
}

impl PlainAuthenticator {
    /// Create an authenticator accepting the credentials for which `check`
    /// returns true.
    pub fn new<F: Fn(&str, &str) -> bool + Send + Sync + 'static>(check: F) -> Self {
        PlainAuthenticator {
            check: Arc::new(check),
            allow_insecure: false,
        }
    }

    /// Offer `PLAIN` on plain text streams, too.
    pub fn allow_insecure(mut self) -> Self {
        self.allow_insecure = true;
        self
    }
}

impl Authenticator for PlainAuthenticator {
    fn mechanisms(&self, secured: bool) -> Vec<String> {
        if secured || self.allow_insecure {
            vec![String::from("PLAIN")]
        } else {
            Vec::new()
        }
    }

    fn start(
        &self,
        name: &str,
        secured: bool,
        _channel_binding: ChannelBinding,
    ) -> Option<Box<dyn SaslMechanism>> {
        if name != "PLAIN" || !(secured || self.allow_insecure) {
            return None;
        }
        let plain = Plain::new(CredentialValidator(Arc::clone(&self.check)));
        Some(Box::new(ClientFirst {
            mechanism: SaslServerMechanism(plain),
            asked: false,
        }))
    }
}

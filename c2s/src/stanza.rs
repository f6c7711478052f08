//! IQ handling on top of the [`xmpp_parsers`] stanza types.
//!
//! A server answers requests on behalf of whoever they were addressed to, so
//! replies swap `from` and `to` and keep the request's id. Error replies carry
//! the error type RFC 6120 recommends for their condition.

use std::collections::BTreeMap;

use jid::Jid;
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::ns;

/// The error type RFC 6120, section 8.3.3 recommends for `condition`.
pub fn default_error_type(condition: &DefinedCondition) -> ErrorType {
    match condition {
        DefinedCondition::BadRequest
        | DefinedCondition::JidMalformed
        | DefinedCondition::NotAcceptable
        | DefinedCondition::PolicyViolation
        | DefinedCondition::Redirect { .. } => ErrorType::Modify,
        DefinedCondition::Forbidden
        | DefinedCondition::NotAuthorized
        | DefinedCondition::RegistrationRequired
        | DefinedCondition::SubscriptionRequired => ErrorType::Auth,
        DefinedCondition::RecipientUnavailable
        | DefinedCondition::RemoteServerTimeout
        | DefinedCondition::ResourceConstraint
        | DefinedCondition::UnexpectedRequest => ErrorType::Wait,
        _ => ErrorType::Cancel,
    }
}

/// A bare `<error/>` for `condition`, without text.
pub fn stanza_error(condition: DefinedCondition) -> StanzaError {
    StanzaError {
        type_: default_error_type(&condition),
        by: None,
        defined_condition: condition,
        texts: BTreeMap::new(),
        other: None,
        alternate_address: None,
    }
}

/// Whether `iq` is a `get` or `set`, which calls for exactly one reply.
pub fn is_request(iq: &Iq) -> bool {
    matches!(iq.payload, IqType::Get(_) | IqType::Set(_))
}

/// The child element of a `get`, `set` or `result` IQ.
pub fn payload(iq: &Iq) -> Option<&Element> {
    match &iq.payload {
        IqType::Get(payload) | IqType::Set(payload) => Some(payload),
        IqType::Result(payload) => payload.as_ref(),
        IqType::Error(_) => None,
    }
}

/// The `result` reply to `request`.
pub fn result_reply(request: &Iq, payload: Option<Element>) -> Iq {
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Result(payload),
    }
}

/// The `error` reply to `request`.
pub fn error_reply(request: &Iq, condition: DefinedCondition) -> Iq {
    Iq {
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        payload: IqType::Error(stanza_error(condition)),
    }
}

/// Parse an `<iq/>` received from a client.
///
/// On failure, returns the error reply owed to the client, if any: only a
/// `get` or `set` carrying an id is ever answered.
pub fn parse_iq(elem: Element) -> Result<Iq, Option<Element>> {
    match Iq::try_from(elem.clone()) {
        Ok(iq) => Ok(iq),
        Err(e) => {
            log::info!("Invalid iq {:?}: {}", elem.attr("id"), e);
            Err(reply_to_malformed(&elem, malformed_condition(&elem)))
        }
    }
}

fn malformed_condition(elem: &Element) -> DefinedCondition {
    let bad_address = ["from", "to"]
        .iter()
        .filter_map(|name| elem.attr(name))
        .any(|value| Jid::new(value).is_err());
    if bad_address {
        DefinedCondition::JidMalformed
    } else {
        DefinedCondition::BadRequest
    }
}

/// Builds an error reply from the raw attributes of an `<iq/>` which could not
/// be parsed into an [`Iq`].
///
/// Returns `None` when the element is not a request with an id, as those must
/// never be answered.
pub fn reply_to_malformed(elem: &Element, condition: DefinedCondition) -> Option<Element> {
    let id = elem.attr("id")?;
    match elem.attr("type") {
        Some("get") | Some("set") => (),
        _ => return None,
    }
    Some(
        Element::builder("iq", ns::JABBER_CLIENT)
            .attr("id", id)
            .attr("type", "error")
            .append(Element::from(stanza_error(condition)))
            .build(),
    )
}

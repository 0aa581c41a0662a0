use std::str::FromStr;

use uuid::Uuid;
use xmpp_parsers::{
    iq::Iq,
    jid::{BareJid, Jid},
    message::{Lang, Message, MessageType},
    minidom::Element,
    presence::{Presence, Show, Type as PresenceType},
    roster,
    stanza_error::{DefinedCondition, ErrorType, StanzaError as XmppStanzaError},
};

use crate::error::{ConnectionError, StanzaError};
use crate::transport::PresenceMode;

#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(Box<Iq>),
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, StanzaError> {
        Self::try_from(parse_element(raw)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StanzaError> {
        let element = Element::from(self.clone());
        let mut payload = Vec::new();
        element.write_to(&mut payload).map_err(|error| {
            StanzaError::SerializeFailed(format!("<{}/>: {error}", self.name()))
        })?;
        Ok(payload)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = StanzaError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        let parse_failed = |kind: &str, error: &dyn std::fmt::Display| {
            StanzaError::ParseFailed(format!("failed to parse <{kind}/> stanza: {error}"))
        };

        match element.name() {
            "message" => Message::try_from(element)
                .map(|message| Stanza::Message(Box::new(message)))
                .map_err(|error| parse_failed("message", &error)),
            "presence" => Presence::try_from(element)
                .map(|presence| Stanza::Presence(Box::new(presence)))
                .map_err(|error| parse_failed("presence", &error)),
            "iq" => Iq::try_from(element)
                .map(|iq| Stanza::Iq(Box::new(iq)))
                .map_err(|error| parse_failed("iq", &error)),
            other => Err(StanzaError::ParseFailed(format!(
                "unsupported stanza element <{other}/>"
            ))),
        }
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        match value {
            Stanza::Message(message) => (*message).into(),
            Stanza::Presence(presence) => (*presence).into(),
            Stanza::Iq(iq) => (*iq).into(),
        }
    }
}

/// Parse one top-level stanza into an element without interpreting it.
pub(crate) fn parse_element(raw: &[u8]) -> Result<Element, StanzaError> {
    let xml = std::str::from_utf8(raw).map_err(|error| {
        StanzaError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}"))
    })?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(StanzaError::ParseFailed("stanza payload is empty".to_string()));
    }

    Element::from_str(trimmed).map_err(|error| {
        StanzaError::ParseFailed(format!("failed to parse stanza XML: {error}"))
    })
}

/// `<priority/>` of a raw presence element; absent or malformed means 0.
pub(crate) fn presence_priority(element: &Element) -> i8 {
    element
        .children()
        .find(|child| child.name() == "priority")
        .and_then(|priority| priority.text().trim().parse().ok())
        .unwrap_or(0)
}

pub(crate) fn parse_jid(jid: &str) -> Result<Jid, ConnectionError> {
    jid.parse::<Jid>()
        .map_err(|_| ConnectionError::InvalidJid(jid.to_string()))
}

pub(crate) fn parse_bare_jid(jid: &str) -> Result<BareJid, ConnectionError> {
    jid.parse::<BareJid>()
        .map_err(|_| ConnectionError::InvalidJid(jid.to_string()))
}

pub(crate) fn presence_mode(show: Option<&Show>) -> PresenceMode {
    match show {
        None => PresenceMode::Available,
        Some(Show::Chat) => PresenceMode::Chat,
        Some(Show::Away) => PresenceMode::Away,
        Some(Show::Xa) => PresenceMode::Xa,
        Some(Show::Dnd) => PresenceMode::Dnd,
    }
}

pub(crate) fn chat_message(to: &str, body: &str) -> Result<Stanza, ConnectionError> {
    let mut message = Message::new_with_type(MessageType::Chat, Some(parse_jid(to)?));
    message.id = Some(xmpp_parsers::message::Id(Uuid::new_v4().to_string()));
    message.bodies.insert(Lang::new(), body.to_string());
    Ok(Stanza::Message(Box::new(message)))
}

/// Initial available presence; an empty status carries no `<status/>`.
pub(crate) fn available_presence(status: &str) -> Stanza {
    let mut presence = Presence::new(PresenceType::None);
    if !status.is_empty() {
        presence.statuses.insert(Lang::new(), status.to_string());
    }
    Stanza::Presence(Box::new(presence))
}

pub(crate) fn unavailable_presence() -> Stanza {
    Stanza::Presence(Box::new(Presence::new(PresenceType::Unavailable)))
}

pub(crate) fn subscription_presence(
    to: &str,
    type_: PresenceType,
) -> Result<Stanza, ConnectionError> {
    let mut presence = Presence::new(type_);
    presence.to = Some(parse_jid(to)?);
    Ok(Stanza::Presence(Box::new(presence)))
}

pub(crate) fn roster_get(id: &str) -> Stanza {
    let query = roster::Roster {
        ver: None,
        items: vec![],
    };
    Stanza::Iq(Box::new(Iq::from_get(id.to_string(), query)))
}

pub(crate) fn roster_set(
    id: &str,
    jid: &str,
    subscription: roster::Subscription,
) -> Result<Stanza, ConnectionError> {
    let item = roster::Item {
        jid: parse_bare_jid(jid)?,
        name: None,
        subscription,
        ask: roster::Ask::None,
        groups: vec![],
    };
    let query = roster::Roster {
        ver: None,
        items: vec![item],
    };
    Ok(Stanza::Iq(Box::new(Iq::from_set(id.to_string(), query))))
}

/// Empty acknowledgement for a server-initiated IQ.
pub(crate) fn iq_result(id: &str, to: Option<Jid>) -> Stanza {
    Stanza::Iq(Box::new(Iq::Result {
        from: None,
        to,
        id: id.to_string(),
        payload: None,
    }))
}

/// `service-unavailable` reply for a request this client does not handle.
pub(crate) fn iq_service_unavailable(id: &str, to: Option<Jid>) -> Stanza {
    let error = XmppStanzaError::new(
        ErrorType::Cancel,
        DefinedCondition::ServiceUnavailable,
        "en",
        "request not supported",
    );
    let mut iq = Iq::from_error(id.to_string(), error);
    if let Some(to) = to {
        iq = iq.with_to(to);
    }
    Stanza::Iq(Box::new(iq))
}

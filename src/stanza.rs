//! Stanza and address data model.
//!
//! The host routing server owns stanza parsing and serialization; this crate
//! only sees the already-parsed fields a filter decision needs. A [`Stanza`]
//! is read-mostly input: the single mutation the pipeline performs is setting
//! the `processed` marker on a rejected stanza.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::JidError;

/// Identifier of the connection a stanza arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c2s-{}", self.0)
    }
}

/// A bare address: `local@domain`, or just `domain` for server components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BareJid {
    local: Option<String>,
    domain: String,
}

impl BareJid {
    /// Build a `local@domain` address.
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: Some(local.into()),
            domain: domain.into(),
        }
    }

    /// Build a domain-only address.
    pub fn domain_only(domain: impl Into<String>) -> Self {
        Self {
            local: None,
            domain: domain.into(),
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.local {
            Some(local) => write!(f, "{}@{}", local, self.domain),
            None => write!(f, "{}", self.domain),
        }
    }
}

impl FromStr for BareJid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Jid::from_str(s)?.into_bare())
    }
}

/// A full address: bare jid plus an optional resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    bare: BareJid,
    resource: Option<String>,
}

impl Jid {
    pub fn new(bare: BareJid, resource: Option<String>) -> Self {
        Self { bare, resource }
    }

    pub fn bare(&self) -> &BareJid {
        &self.bare
    }

    pub fn into_bare(self) -> BareJid {
        self.bare
    }

    pub fn to_bare(&self) -> BareJid {
        self.bare.clone()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn domain(&self) -> &str {
        self.bare.domain()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{}/{}", self.bare, resource),
            None => write!(f, "{}", self.bare),
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) if !resource.is_empty() => {
                (bare, Some(resource.to_string()))
            }
            Some(_) => return Err(JidError::new(s)),
            None => (s, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };
        if domain.is_empty() || local.is_some_and(str::is_empty) {
            return Err(JidError::new(s));
        }
        Ok(Self {
            bare: BareJid {
                local: local.map(str::to_string),
                domain: domain.to_string(),
            },
            resource,
        })
    }
}

/// Top-level stanza element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// The `type` attribute of a stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaType {
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
}

/// A single routable message/presence/iq unit, as seen by the filter chain.
#[derive(Debug)]
pub struct Stanza {
    kind: StanzaKind,
    stanza_type: Option<StanzaType>,
    from: Option<Jid>,
    to: Option<Jid>,
    body: Option<String>,
    connection: Option<ConnectionId>,
    has_error_payload: bool,
    processed: AtomicBool,
}

impl Stanza {
    pub fn new(kind: StanzaKind) -> Self {
        Self {
            kind,
            stanza_type: None,
            from: None,
            to: None,
            body: None,
            connection: None,
            has_error_payload: false,
            processed: AtomicBool::new(false),
        }
    }

    /// A chat message carrying a body.
    pub fn message(from: Jid, to: Jid, body: impl Into<String>) -> Self {
        Self::new(StanzaKind::Message)
            .with_type(StanzaType::Chat)
            .with_from(from)
            .with_to(to)
            .with_body(body)
    }

    /// A presence subscription request.
    pub fn subscribe(from: Jid, to: Jid) -> Self {
        Self::new(StanzaKind::Presence)
            .with_type(StanzaType::Subscribe)
            .with_from(from)
            .with_to(to)
    }

    pub fn with_type(mut self, stanza_type: StanzaType) -> Self {
        self.stanza_type = Some(stanza_type);
        self
    }

    pub fn with_from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Tag the stanza with the connection it originated from.
    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_error_payload(mut self) -> Self {
        self.has_error_payload = true;
        self
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn stanza_type(&self) -> Option<StanzaType> {
        self.stanza_type
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn has_error_payload(&self) -> bool {
        self.has_error_payload
    }

    /// Mark the stanza as handled so the host does not forward it.
    pub fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    /// Synthesize a protocol-level error bounce for this stanza.
    ///
    /// Addresses are swapped and no detection detail is included; the sender
    /// must not learn why the stanza was rejected.
    pub fn error_response(&self) -> Stanza {
        let mut response = Stanza::new(self.kind)
            .with_type(StanzaType::Error)
            .with_error_payload();
        if let Some(from) = &self.to {
            response = response.with_from(from.clone());
        }
        if let Some(to) = &self.from {
            response = response.with_to(to.clone());
        }
        response
    }
}

use crate::identity::{self, Identity, IdentityError};
use std::fmt;

/// Subject suffix shared by both per-entity heartbeat subjects
const HEARTBEAT_SUFFIX: &str = "heartbeat";

/// A decoded heartbeat message
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub identity: Identity,
    /// Unix epoch seconds embedded by the sender
    pub epoch: i64,
}

/// Why a transport message could not be routed
#[derive(Debug, Clone, PartialEq)]
pub enum RouteError {
    /// Subject is not `{prefix}.{address}.heartbeat`
    UnknownSubject(String),
    /// Address token failed normalization
    InvalidIdentity(IdentityError),
    /// Payload is not a decimal epoch
    InvalidPayload(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::UnknownSubject(s) => write!(f, "unrecognized heartbeat subject '{}'", s),
            RouteError::InvalidIdentity(e) => write!(f, "invalid identity in subject: {}", e),
            RouteError::InvalidPayload(p) => {
                write!(f, "payload '{}' is not a decimal epoch-seconds integer", p)
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Maps entities to transport subjects and decodes delivered messages
///
/// Subject layout (NATS tokens are '.'-separated):
/// - `{prefix}.aa:bb:cc:dd:ee:ff.heartbeat`
/// - `{prefix}.aabbccddeeff.heartbeat` (legacy senders)
#[derive(Debug, Clone)]
pub struct HeartbeatRouter {
    prefix: String,
}

impl HeartbeatRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The two subjects an entity's heartbeats may arrive on
    pub fn subjects_for(&self, identity: &Identity) -> [String; 2] {
        [
            format!("{}.{}.{}", self.prefix, identity, HEARTBEAT_SUFFIX),
            format!("{}.{}.{}", self.prefix, identity.compact(), HEARTBEAT_SUFFIX),
        ]
    }

    /// Decode a (subject, payload) pair into a heartbeat
    pub fn parse(&self, subject: &str, payload: &[u8]) -> Result<Heartbeat, RouteError> {
        let address = subject
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|rest| rest.strip_suffix(HEARTBEAT_SUFFIX))
            .and_then(|rest| rest.strip_suffix('.'))
            .filter(|address| !address.is_empty() && !address.contains('.'))
            .ok_or_else(|| RouteError::UnknownSubject(subject.to_string()))?;

        let identity = identity::normalize(address).map_err(RouteError::InvalidIdentity)?;
        let epoch = parse_epoch(payload)?;

        Ok(Heartbeat { identity, epoch })
    }
}

/// Parse a decimal ASCII epoch-seconds payload
pub fn parse_epoch(payload: &[u8]) -> Result<i64, RouteError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| RouteError::InvalidPayload(String::from_utf8_lossy(payload).into_owned()))?;
    let trimmed = text.trim();

    match trimmed.parse::<i64>() {
        Ok(epoch) if epoch > 0 => Ok(epoch),
        _ => Err(RouteError::InvalidPayload(trimmed.to_string())),
    }
}

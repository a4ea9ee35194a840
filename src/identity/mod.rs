use serde::{Deserialize, Serialize};
use std::fmt;


/// Canonical hardware-address key for a tracked entity
///
/// Always six lowercase hex octets joined by ':' (e.g. "aa:bb:cc:dd:ee:ff").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Colon-delimited form used as the registry and store key
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Delimiter-free form ("aabbccddeeff") used by legacy heartbeat senders
    pub fn compact(&self) -> String {
        self.0.replace(':', "")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize(&value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl std::str::FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s)
    }
}

/// Identity normalization errors
#[derive(Debug, Clone, PartialEq)]
pub enum IdentityError {
    /// Empty (or whitespace-only) input
    Empty,
    /// Wrong number of hex digits once delimiters are removed
    InvalidLength(String),
    /// Non-hex character in an octet
    InvalidCharacter(String),
    /// Delimiters present but not splitting the address into six octets
    InvalidFormat(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Empty => write!(f, "hardware address is required"),
            IdentityError::InvalidLength(s) => {
                write!(f, "hardware address '{}' must contain exactly 12 hex digits", s)
            }
            IdentityError::InvalidCharacter(s) => {
                write!(f, "hardware address '{}' contains a non-hex character", s)
            }
            IdentityError::InvalidFormat(s) => {
                write!(f, "hardware address '{}' must have six octets separated by ':', '-' or '.'", s)
            }
        }
    }
}

impl std::error::Error for IdentityError {}

/// Canonicalize a hardware address into an [`Identity`]
///
/// Accepts the common spellings of a 48-bit MAC address:
/// - "AA:BB:CC:DD:EE:FF" (colon)
/// - "aa-bb-cc-dd-ee-ff" (dash)
/// - "aabb.ccdd.eeff" (Cisco dotted)
/// - "AABBCCDDEEFF" (bare)
///
/// # Examples
///
/// ```
/// use hearth::identity::normalize;
///
/// let id = normalize("AA-BB-CC-DD-EE-0F").unwrap();
/// assert_eq!(id.as_str(), "aa:bb:cc:dd:ee:0f");
/// assert_eq!(id.compact(), "aabbccddee0f");
/// ```
pub fn normalize(raw: &str) -> Result<Identity, IdentityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Empty);
    }

    let groups: Vec<&str> = trimmed.split([':', '-', '.']).collect();
    let digits: String = match groups.len() {
        // Bare or dotted; both reduce to the same 12 hex digits
        1 | 3 => groups.concat(),
        6 => {
            // Single-digit octets ("a:b:c:d:e:f") are zero-padded
            let mut out = String::with_capacity(12);
            for group in &groups {
                match group.len() {
                    1 => {
                        out.push('0');
                        out.push_str(group);
                    }
                    2 => out.push_str(group),
                    _ => return Err(IdentityError::InvalidFormat(trimmed.to_string())),
                }
            }
            out
        }
        _ => return Err(IdentityError::InvalidFormat(trimmed.to_string())),
    };

    if groups.len() == 3 && groups.iter().any(|g| g.len() != 4) {
        return Err(IdentityError::InvalidFormat(trimmed.to_string()));
    }

    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IdentityError::InvalidCharacter(trimmed.to_string()));
    }

    if digits.len() != 12 {
        return Err(IdentityError::InvalidLength(trimmed.to_string()));
    }

    let lower = digits.to_ascii_lowercase();
    let canonical = lower
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":");

    Ok(Identity(canonical))
}

//! Limit key derivation.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separates scope and subject before hashing. Not expected in either part.
pub const KEY_SEPARATOR: char = '\u{1f}';

const ANONYMOUS_PREFIX: &str = "anonymous:";
const GLOBAL_PREFIX: &str = "global:";

/// An opaque key identifying one rate-limited subject's window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LimitKey(String);

impl LimitKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the unhashed bucket shared by callers with no identity.
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(ANONYMOUS_PREFIX)
    }

    /// Whether this is the window shared by every caller of a global policy.
    pub fn is_global(&self) -> bool {
        self.0.starts_with(GLOBAL_PREFIX)
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Caller identity as supplied by the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Remote network address
    Address(IpAddr),
    /// API credential
    Credential(String),
    /// Authenticated user id
    User(String),
    /// Anything else, used verbatim
    Raw(String),
}

impl Subject {
    /// Render the subject as the string fed to the resolver.
    ///
    /// Typed variants get a kind prefix so an address and a user id that
    /// happen to share a spelling never share a window. An empty identity
    /// renders empty and lands in the anonymous bucket.
    pub fn render(&self) -> String {
        match self {
            Subject::Address(ip) => format!("addr:{}", ip),
            Subject::Credential(c) if c.is_empty() => String::new(),
            Subject::Credential(c) => format!("key:{}", c),
            Subject::User(u) if u.is_empty() => String::new(),
            Subject::User(u) => format!("user:{}", u),
            Subject::Raw(s) => s.clone(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<IpAddr> for Subject {
    fn from(ip: IpAddr) -> Self {
        Subject::Address(ip)
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Subject::Raw(s.to_string())
    }
}

impl From<String> for Subject {
    fn from(s: String) -> Self {
        Subject::Raw(s)
    }
}

/// Derives limit keys from a scope and a subject.
///
/// Keys are deterministic across processes: there is no per-process salt.
#[derive(Debug, Clone, Copy)]
pub struct IdentifierResolver {
    hash_keys: bool,
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierResolver {
    /// Resolver producing SHA-256 hashed keys.
    pub fn new() -> Self {
        Self { hash_keys: true }
    }

    /// Resolver that stores `scope` and `subject` in the clear. Meant for
    /// local debugging; raw addresses and credentials end up in the store.
    pub fn plain() -> Self {
        Self { hash_keys: false }
    }

    pub fn with_hashing(hash_keys: bool) -> Self {
        Self { hash_keys }
    }

    /// Derive the key for `subject` under `scope`.
    ///
    /// An empty subject maps to an unhashed `anonymous:<scope>` key, so
    /// unidentified callers share one bucket instead of escaping limits.
    pub fn resolve(&self, scope: &str, subject: &str) -> LimitKey {
        if subject.is_empty() {
            return LimitKey(format!("{}{}", ANONYMOUS_PREFIX, scope));
        }

        let joined = format!("{}{}{}", scope, KEY_SEPARATOR, subject);
        if !self.hash_keys {
            return LimitKey(joined);
        }

        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        LimitKey(format!("{:x}", hasher.finalize()))
    }

    /// Derive the caller-independent key for a global policy.
    ///
    /// Lives outside the subject key space: hashed keys are bare hex and
    /// plain keys always contain the separator, so no subject (not even a
    /// raw `*`) can land on it.
    pub fn resolve_global(&self, scope: &str) -> LimitKey {
        LimitKey(format!("{}{}", GLOBAL_PREFIX, scope))
    }
}

//! Rate limit key composition.

use std::fmt;

/// A key that identifies a caller within an endpoint class.
///
/// The limiter treats keys as opaque strings; this type only standardises the
/// `"<class>:<client>"` layout the routing layer uses. The class is stored
/// lowercase, matching how policy classes are looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The endpoint class (e.g. `auth`, `export`)
    pub class: String,
    /// The client identifier (IP address, user or tenant id)
    pub client: String,
}

impl RateLimitKey {
    /// Create a new key from an endpoint class and a client identifier.
    pub fn new(class: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            class: super::policy::normalize_class(class.into()),
            client: client.into(),
        }
    }

    /// The string used to index the counter store.
    pub fn to_string_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.client)
    }
}

impl From<RateLimitKey> for String {
    fn from(key: RateLimitKey) -> Self {
        key.to_string_key()
    }
}

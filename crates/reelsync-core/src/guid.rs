//! Entity identifiers.
//!
//! A guid addresses one entity of the editorial model (a project, a clip, a bin
//! item, ...) identically on every participant. The format is opaque to the
//! protocol; it is carried as plain text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A globally unique entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

impl Guid {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this is the empty guid.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Guid {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for Guid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Guid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> Self {
        guid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_raw_id() {
        let guid = Guid::new("3f2c-clip");
        assert_eq!(guid.to_string(), "3f2c-clip");
        assert_eq!(guid.as_str(), "3f2c-clip");
    }

    #[test]
    fn serializes_as_plain_string() {
        let guid = Guid::from("seq-1");
        assert_eq!(serde_json::to_string(&guid).unwrap(), "\"seq-1\"");
        let back: Guid = serde_json::from_str("\"seq-1\"").unwrap();
        assert_eq!(back, guid);
    }
}

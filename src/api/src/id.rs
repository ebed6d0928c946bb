// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Run identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// A stable identifier for a running application or runnable instance.
///
/// A `RunId` is a freshly generated UUID base, optionally qualified with an
/// instance number: `<base>[-<instance>]`. Instance-qualified ids are only
/// ever produced structurally via [`RunId::derive`], never by parsing, so
/// the base is unambiguous even when it happens to end in digits.
///
/// All simultaneously live instances of a runnable share a base; once the
/// last instance of a runnable exits, the next instance to start receives a
/// fresh base.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId {
    base: String,
    instance: Option<u32>,
}

impl RunId {
    /// Generates a fresh, unqualified run id.
    pub fn generate() -> RunId {
        RunId {
            base: Uuid::new_v4().to_string(),
            instance: None,
        }
    }

    /// Constructs an unqualified run id from an externally supplied base,
    /// e.g. the application run id handed down by the launcher.
    pub fn from_base<S: Into<String>>(base: S) -> RunId {
        RunId {
            base: base.into(),
            instance: None,
        }
    }

    /// Returns the id `<base>-<instance>`, reusing this id's base.
    pub fn derive(&self, instance: u32) -> RunId {
        RunId {
            base: self.base.clone(),
            instance: Some(instance),
        }
    }

    /// The base portion of the id, without any instance qualifier.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// The instance qualifier, if this id names a runnable instance.
    pub fn instance(&self) -> Option<u32> {
        self.instance
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.instance {
            None => f.write_str(&self.base),
            Some(i) => write!(f, "{}-{}", self.base, i),
        }
    }
}

impl FromStr for RunId {
    type Err = std::convert::Infallible;

    // The whole string becomes the base. Instance qualifiers are only
    // attached via `derive`; splitting on `-` would misparse UUID bases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RunId::from_base(s))
    }
}

impl Serialize for RunId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RunId::from_base(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_preserves_base() {
        let base = RunId::generate();
        let first = base.derive(0);
        let second = first.derive(7);
        assert_eq!(first.base(), base.base());
        assert_eq!(second.base(), base.base());
        assert_eq!(second.instance(), Some(7));
        assert_eq!(second.to_string(), format!("{}-7", base.base()));
    }

    #[test]
    fn test_generate_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }

    #[test]
    fn test_serde_display_form() {
        let id = RunId::from_base("abc").derive(3);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc-3\"");
    }
}

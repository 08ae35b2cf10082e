//! Studio identity triple.
//!
//! A studio is addressed by `(name, teamspace, org)`. The triple is unique
//! among live studios; the backend enforces it and the client relies on it
//! for find-or-create and per-identity serialization.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of any identity component.
pub const MAX_COMPONENT_LEN: usize = 64;

/// Value type uniquely identifying a studio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawIdentity")]
pub struct StudioIdentity {
    name: String,
    teamspace: String,
    org: String,
}

#[derive(Deserialize)]
struct RawIdentity {
    name: String,
    teamspace: String,
    org: String,
}

impl TryFrom<RawIdentity> for StudioIdentity {
    type Error = IdentityError;

    fn try_from(raw: RawIdentity) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.teamspace, raw.org)
    }
}

impl StudioIdentity {
    /// Build a validated identity.
    ///
    /// # Errors
    ///
    /// Returns an error if any component is empty, longer than
    /// [`MAX_COMPONENT_LEN`], or contains characters other than ASCII
    /// alphanumerics, `-`, `_` and `.`.
    pub fn new(
        name: impl Into<String>,
        teamspace: impl Into<String>,
        org: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            name: name.into(),
            teamspace: teamspace.into(),
            org: org.into(),
        };
        validate_component("name", &identity.name)?;
        validate_component("teamspace", &identity.teamspace)?;
        validate_component("org", &identity.org)?;
        Ok(identity)
    }

    /// The studio name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The teamspace the studio lives in.
    #[must_use]
    pub fn teamspace(&self) -> &str {
        &self.teamspace
    }

    /// The owning organization.
    #[must_use]
    pub fn org(&self) -> &str {
        &self.org
    }

    /// Same teamspace and org, different name.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a valid component.
    pub fn with_name(&self, name: impl Into<String>) -> Result<Self, IdentityError> {
        Self::new(name, self.teamspace.clone(), self.org.clone())
    }

    /// True if both identities live in the same teamspace of the same org.
    #[must_use]
    pub fn same_teamspace(&self, other: &Self) -> bool {
        self.teamspace == other.teamspace && self.org == other.org
    }
}

impl fmt::Display for StudioIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org, self.teamspace, self.name)
    }
}

fn validate_component(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty(field));
    }
    if value.len() > MAX_COMPONENT_LEN {
        return Err(IdentityError::TooLong {
            field,
            max: MAX_COMPONENT_LEN,
        });
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(IdentityError::InvalidCharacter { field, found: c });
    }
    Ok(())
}

/// Errors produced when validating a studio identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// A component was empty.
    #[error("studio {0} must not be empty")]
    Empty(&'static str),

    /// A component exceeded the maximum length.
    #[error("studio {field} exceeds {max} characters")]
    TooLong {
        /// Which component.
        field: &'static str,
        /// The limit.
        max: usize,
    },

    /// A component contained a character outside the allowed set.
    #[error("studio {field} contains invalid character {found:?}")]
    InvalidCharacter {
        /// Which component.
        field: &'static str,
        /// The offending character.
        found: char,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identity() {
        let id = StudioIdentity::new("my-sdk-studio", "language-model", "23110301").unwrap();
        assert_eq!(id.name(), "my-sdk-studio");
        assert_eq!(id.teamspace(), "language-model");
        assert_eq!(id.org(), "23110301");
        assert_eq!(id.to_string(), "23110301/language-model/my-sdk-studio");
    }

    #[test]
    fn rejects_empty_and_bad_chars() {
        assert_eq!(
            StudioIdentity::new("", "team", "org"),
            Err(IdentityError::Empty("name"))
        );
        assert!(matches!(
            StudioIdentity::new("demo", "team space", "org"),
            Err(IdentityError::InvalidCharacter {
                field: "teamspace",
                found: ' '
            })
        ));
        assert!(matches!(
            StudioIdentity::new("demo", "team", "o".repeat(65)),
            Err(IdentityError::TooLong { field: "org", .. })
        ));
    }

    #[test]
    fn with_name_keeps_teamspace() {
        let id = StudioIdentity::new("demo", "team", "org1").unwrap();
        let copy = id.with_name("demo-copy").unwrap();
        assert!(copy.same_teamspace(&id));
        assert_ne!(copy, id);
    }

    #[test]
    fn deserialize_validates() {
        let ok: StudioIdentity =
            serde_json::from_str(r#"{"name":"demo","teamspace":"team","org":"org1"}"#).unwrap();
        assert_eq!(ok.name(), "demo");

        let bad = serde_json::from_str::<StudioIdentity>(
            r#"{"name":"","teamspace":"team","org":"org1"}"#,
        );
        assert!(bad.is_err());
    }
}

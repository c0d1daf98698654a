use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use miette::Diagnostic;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// A Python package name as it appeared at a system boundary (a wheel's
/// METADATA, an operator-typed argument, or an upstream index response),
/// paired with its canonical form.
///
/// Canonicalization folds the name to lowercase and maps underscores to
/// hyphens. It is applied exactly once, here; everything past the boundary
/// works with [`NormalizedPackageName`].
#[derive(Debug, Clone, Eq, DeserializeFromStr)]
pub struct PackageName {
    /// The name exactly as it was given to us.
    given: Box<str>,

    /// The canonical form of `given`.
    normalized: Box<str>,
}

impl PackageName {
    /// Returns the name as it was originally written.
    pub fn as_given(&self) -> &str {
        self.given.as_ref()
    }

    /// Returns the canonical name.
    pub fn as_str(&self) -> &str {
        self.normalized.as_ref()
    }
}

#[derive(Debug, Clone, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum ParsePackageNameError {
    #[error("invalid package name '{0}'")]
    InvalidPackageName(String),
}

impl FromStr for PackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static NAME_VALIDATE: OnceLock<Regex> = OnceLock::new();
        let name_validate = NAME_VALIDATE.get_or_init(|| {
            // https://packaging.python.org/specifications/core-metadata/#name
            Regex::new(r"(?i-u)^([A-Z0-9]|[A-Z0-9][A-Z0-9._-]*[A-Z0-9])$").unwrap()
        });

        if !name_validate.is_match(s) {
            return Err(ParsePackageNameError::InvalidPackageName(s.into()));
        }

        let mut normalized = s.replace('_', "-");
        normalized.make_ascii_lowercase();

        Ok(PackageName {
            given: s.to_owned().into_boxed_str(),
            normalized: normalized.into_boxed_str(),
        })
    }
}

impl Display for PackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.given)
    }
}

impl Hash for PackageName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state)
    }
}

impl PartialEq for PackageName {
    fn eq(&self, other: &Self) -> bool {
        self.normalized.eq(&other.normalized)
    }
}

impl PartialOrd for PackageName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl Serialize for PackageName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.given.as_ref().serialize(serializer)
    }
}

/// A package name in canonical form: lowercase, underscores replaced by
/// hyphens. Declaration files, state files, and the cross-ecosystem mapping
/// are all keyed by this type.
#[repr(transparent)]
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct NormalizedPackageName(Box<str>);

impl From<PackageName> for NormalizedPackageName {
    fn from(value: PackageName) -> Self {
        Self(value.normalized)
    }
}

impl From<NormalizedPackageName> for PackageName {
    fn from(value: NormalizedPackageName) -> Self {
        Self {
            given: value.0.clone(),
            normalized: value.0,
        }
    }
}

impl Display for NormalizedPackageName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NormalizedPackageName {
    /// Returns a string reference.
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl FromStr for NormalizedPackageName {
    type Err = ParsePackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PackageName::from_str(s)?.into())
    }
}

impl Borrow<str> for NormalizedPackageName {
    fn borrow(&self) -> &str {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_canonicalization() {
        let name1: PackageName = "Typing_Extensions".parse().unwrap();
        assert_eq!(name1.as_given(), "Typing_Extensions");
        assert_eq!(name1.as_str(), "typing-extensions");

        let name2: PackageName = "typing-extensions".parse().unwrap();
        assert_eq!(name1, name2);

        let name3: PackageName = "typingextensions".parse().unwrap();
        assert_ne!(name1, name3);
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        for raw in ["My_Package", "my-package", "A1", "pkg_with_many_parts"] {
            let once: PackageName = raw.parse().unwrap();
            let twice: PackageName = once.as_str().parse().unwrap();
            assert_eq!(once.as_str(), twice.as_str());
        }
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(PackageName::from_str("-leading-dash").is_err());
        assert!(PackageName::from_str("trailing_").is_err());
        assert!(PackageName::from_str("").is_err());
        assert!(PackageName::from_str("has space").is_err());
    }
}

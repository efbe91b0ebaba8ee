use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Key namespace holding one `CachedProduct` per office.
pub const PAYLOAD_PREFIX: &str = "afd/";
/// Key namespace holding one `RefreshMeta` per office.
pub const META_PREFIX: &str = "afd-meta/";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid office code {0:?}; expected letters and digits only.")]
pub struct InvalidOfficeCode(pub String);

/// An uppercase forecast office identifier, e.g. `BOX`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OfficeCode(String);

impl OfficeCode {
    pub fn parse(raw: &str) -> Result<Self, InvalidOfficeCode> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidOfficeCode(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn payload_key(&self) -> String {
        format!("{}{}", PAYLOAD_PREFIX, self.0)
    }

    pub fn meta_key(&self) -> String {
        format!("{}{}", META_PREFIX, self.0)
    }

    /// Recovers the office from a key under [`PAYLOAD_PREFIX`].
    pub fn from_payload_key(key: &str) -> Option<Self> {
        key.strip_prefix(PAYLOAD_PREFIX)
            .and_then(|rest| Self::parse(rest).ok())
    }
}

impl fmt::Display for OfficeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OfficeCode {
    type Err = InvalidOfficeCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OfficeCode {
    type Error = InvalidOfficeCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OfficeCode> for String {
    fn from(value: OfficeCode) -> Self {
        value.0
    }
}

impl AsRef<str> for OfficeCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

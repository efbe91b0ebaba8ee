use crate::office::OfficeCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The cached copy of an office's latest forecast discussion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedProduct {
    pub office: OfficeCode,
    /// Issuance time as reported upstream. Kept verbatim.
    pub issued: Option<String>,
    pub product_id: Option<String>,
    pub original_text: String,
    /// When this copy was written locally.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Cache validators for an office. A missing record reads as all-`None`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshMeta {
    pub last_list_modified: Option<String>,
    pub last_product_id: Option<String>,
}

/// How a single office's refresh ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshStatus {
    /// Upstream answered 304 and a payload is cached.
    NotModified,
    /// Upstream currently has no product for the office.
    NoProduct,
    /// Upstream's latest product is the one already cached.
    NoChange,
    /// The known product was missing from storage and has been rewritten.
    Backfilled,
    Updated,
}

impl RefreshStatus {
    pub fn wrote_payload(self) -> bool {
        matches!(self, Self::Backfilled | Self::Updated)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub office: String,
    pub updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RefreshStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RefreshOutcome {
    pub fn from_status(office: &OfficeCode, status: RefreshStatus) -> Self {
        Self {
            office: office.to_string(),
            updated: status.wrote_payload(),
            reason: Some(status),
            error: None,
        }
    }

    pub fn failed(office: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            office: office.into(),
            updated: false,
            reason: None,
            error: Some(error.into()),
        }
    }
}

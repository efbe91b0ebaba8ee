use crate::office::OfficeCode;
use async_trait::async_trait;

/// Fields of the newest upstream product. Any of them may be missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProductFields {
    pub id: Option<String>,
    pub issued: Option<String>,
    pub text: Option<String>,
}

impl ProductFields {
    /// The text body, or `None` if upstream sent nothing usable.
    pub fn usable_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchResponse {
    /// The conditional token still matches upstream.
    NotModified { freshness_token: Option<String> },
    /// The newest product is the `known_product_id` the caller passed; its
    /// body was not downloaded.
    Unchanged { freshness_token: Option<String> },
    Content {
        product: ProductFields,
        freshness_token: Option<String>,
    },
}

/// Source of the latest product for an office.
///
/// When `conditional_token` is set, implementations must return
/// [`FetchResponse::NotModified`] if upstream has not changed since that token.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch_latest(
        &self,
        office: &OfficeCode,
        conditional_token: Option<&str>,
    ) -> anyhow::Result<FetchResponse>;

    /// Like [`Upstream::fetch_latest`], but may answer
    /// [`FetchResponse::Unchanged`] instead of fetching the body when the
    /// newest product is `known_product_id`.
    async fn fetch_changed(
        &self,
        office: &OfficeCode,
        conditional_token: Option<&str>,
        known_product_id: Option<&str>,
    ) -> anyhow::Result<FetchResponse> {
        let _ = known_product_id;
        self.fetch_latest(office, conditional_token).await
    }
}

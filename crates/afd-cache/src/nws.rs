use afd_cache_core::{
    office::OfficeCode,
    upstream::{FetchResponse, ProductFields, Upstream},
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{
    header::{ACCEPT, IF_MODIFIED_SINCE, LAST_MODIFIED},
    Client, StatusCode,
};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub const DEFAULT_NWS_BASE_URL: &str = "https://api.weather.gov";
const PRODUCT_TYPE: &str = "AFD";

/// Upstream client for the NWS products API.
///
/// Lists the newest AFD for an office (conditionally, with
/// `If-Modified-Since`) and, when there is one, fetches its text.
#[derive(Clone)]
pub struct NwsClient {
    client: Client,
    base_url: Url,
}

enum NwsResponse {
    NotModified { last_modified: Option<String> },
    Json { body: Value, last_modified: Option<String> },
}

/// The first entry of a products listing.
#[derive(Debug, Default, PartialEq, Eq)]
struct LatestListing {
    id: Option<String>,
    url: Option<String>,
    issued: Option<String>,
}

impl LatestListing {
    fn product_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.url.as_deref())
    }
}

impl NwsClient {
    pub fn new(mut base_url: Url, user_agent: &str, timeout: Duration) -> Result<Self> {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, base_url })
    }

    fn listing_url(&self, office: &OfficeCode) -> Result<Url> {
        let mut url = self.base_url.join(&format!(
            "products/types/{}/locations/{}",
            PRODUCT_TYPE, office
        ))?;
        url.query_pairs_mut().append_pair("limit", "1");
        Ok(url)
    }

    fn product_url(&self, latest: &LatestListing) -> Result<Url> {
        if let Some(url) = &latest.url {
            return Url::parse(url).with_context(|| format!("Bad product URL {}", url));
        }
        match &latest.id {
            Some(id) if id.starts_with("http://") || id.starts_with("https://") => {
                Url::parse(id).with_context(|| format!("Bad product URL {}", id))
            }
            Some(id) => Ok(self.base_url.join(&format!("products/{}", id))?),
            None => bail!("NWS listing entry has neither an id nor a URL"),
        }
    }

    async fn get_json(&self, url: Url, if_modified_since: Option<&str>) -> Result<NwsResponse> {
        let mut request = self.client.get(url).header(ACCEPT, "application/ld+json");
        if let Some(token) = if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, token);
        }

        let response = request.send().await.context("NWS request failed")?;
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(NwsResponse::NotModified { last_modified });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("NWS {}: {}", status.as_u16(), body.trim());
        }

        let body = response
            .json()
            .await
            .context("NWS returned a body that is not JSON")?;
        Ok(NwsResponse::Json {
            body,
            last_modified,
        })
    }
}

#[async_trait]
impl Upstream for NwsClient {
    async fn fetch_latest(
        &self,
        office: &OfficeCode,
        conditional_token: Option<&str>,
    ) -> Result<FetchResponse> {
        self.fetch_changed(office, conditional_token, None).await
    }

    async fn fetch_changed(
        &self,
        office: &OfficeCode,
        conditional_token: Option<&str>,
        known_product_id: Option<&str>,
    ) -> Result<FetchResponse> {
        let listing = self
            .get_json(self.listing_url(office)?, conditional_token)
            .await?;

        let (body, last_modified) = match listing {
            NwsResponse::NotModified { last_modified } => {
                return Ok(FetchResponse::NotModified {
                    freshness_token: last_modified.or_else(|| conditional_token.map(str::to_string)),
                })
            }
            NwsResponse::Json {
                body,
                last_modified,
            } => (body, last_modified),
        };

        let Some(latest) = latest_from_listing(&body) else {
            return Ok(FetchResponse::Content {
                product: ProductFields::default(),
                freshness_token: last_modified,
            });
        };

        if known_product_id.is_some() && latest.product_id() == known_product_id {
            return Ok(FetchResponse::Unchanged {
                freshness_token: last_modified,
            });
        }

        let product = match self.get_json(self.product_url(&latest)?, None).await? {
            NwsResponse::Json { body, .. } => body,
            NwsResponse::NotModified { .. } => {
                bail!("NWS answered 304 to an unconditional product request")
            }
        };

        Ok(FetchResponse::Content {
            product: ProductFields {
                id: latest.product_id().map(str::to_string),
                issued: latest.issued.or_else(|| string_field(&product, "issuanceTime")),
                text: product_text(&product),
            },
            freshness_token: last_modified,
        })
    }
}

fn string_field(value: &Value, name: &str) -> Option<String> {
    value
        .get(name)
        .or_else(|| value.get("properties").and_then(|p| p.get(name)))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Listings come back as JSON-LD (`@graph`) or GeoJSON (`features`).
fn latest_from_listing(body: &Value) -> Option<LatestListing> {
    let entry = body
        .get("@graph")
        .or_else(|| body.get("features"))
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())?;

    Some(LatestListing {
        id: string_field(entry, "id"),
        url: string_field(entry, "@id"),
        issued: string_field(entry, "issuanceTime").or_else(|| string_field(entry, "issued")),
    })
}

fn product_text(body: &Value) -> Option<String> {
    body.get("productText")
        .or_else(|| body.pointer("/product/text"))
        .or_else(|| body.get("product"))
        .or_else(|| body.pointer("/properties/productText"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn client(base: &str) -> NwsClient {
        NwsClient::new(base.parse().unwrap(), "afd-cache-test", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn builds_listing_url() {
        let office = OfficeCode::parse("box").unwrap();
        assert_eq!(
            client(DEFAULT_NWS_BASE_URL)
                .listing_url(&office)
                .unwrap()
                .as_str(),
            "https://api.weather.gov/products/types/AFD/locations/BOX?limit=1"
        );
        assert_eq!(
            client("http://localhost:8081/nws")
                .listing_url(&office)
                .unwrap()
                .as_str(),
            "http://localhost:8081/nws/products/types/AFD/locations/BOX?limit=1"
        );
    }

    #[test]
    fn reads_json_ld_listing() {
        let body = json!({
            "@context": {},
            "@graph": [{
                "@id": "https://api.weather.gov/products/0a1b",
                "id": "0a1b",
                "issuanceTime": "2024-05-01T10:00:00+00:00",
                "productCode": "AFD"
            }]
        });
        assert_eq!(
            latest_from_listing(&body),
            Some(LatestListing {
                id: Some("0a1b".to_string()),
                url: Some("https://api.weather.gov/products/0a1b".to_string()),
                issued: Some("2024-05-01T10:00:00+00:00".to_string()),
            })
        );
    }

    #[test]
    fn reads_geojson_listing() {
        let body = json!({
            "features": [{
                "id": "https://api.weather.gov/products/0a1b",
                "properties": {"issuanceTime": "2024-05-01T10:00:00+00:00"}
            }]
        });
        let latest = latest_from_listing(&body).unwrap();
        assert_eq!(latest.issued.as_deref(), Some("2024-05-01T10:00:00+00:00"));
        assert_eq!(
            client(DEFAULT_NWS_BASE_URL)
                .product_url(&latest)
                .unwrap()
                .as_str(),
            "https://api.weather.gov/products/0a1b"
        );
    }

    #[test]
    fn product_id_prefers_id_over_url() {
        let latest = latest_from_listing(&json!({
            "@graph": [{"@id": "https://api.weather.gov/products/0a1b", "id": "0a1b"}]
        }))
        .unwrap();
        assert_eq!(latest.product_id(), Some("0a1b"));

        let latest = latest_from_listing(&json!({
            "@graph": [{"@id": "https://api.weather.gov/products/0a1b"}]
        }))
        .unwrap();
        assert_eq!(
            latest.product_id(),
            Some("https://api.weather.gov/products/0a1b")
        );
    }

    #[test]
    fn empty_listing_has_no_latest() {
        assert_eq!(latest_from_listing(&json!({"@graph": []})), None);
        assert_eq!(latest_from_listing(&json!({})), None);
    }

    #[test]
    fn product_url_falls_back_to_id() {
        let latest = LatestListing {
            id: Some("0a1b".to_string()),
            ..Default::default()
        };
        assert_eq!(
            client(DEFAULT_NWS_BASE_URL)
                .product_url(&latest)
                .unwrap()
                .as_str(),
            "https://api.weather.gov/products/0a1b"
        );
        assert!(client(DEFAULT_NWS_BASE_URL)
            .product_url(&LatestListing::default())
            .is_err());
    }

    #[test]
    fn finds_product_text() {
        assert_eq!(
            product_text(&json!({"productText": "000\nFXUS61 KBOX"})).as_deref(),
            Some("000\nFXUS61 KBOX")
        );
        assert_eq!(
            product_text(&json!({"product": {"text": "nested"}})).as_deref(),
            Some("nested")
        );
        assert_eq!(product_text(&json!({"product": "flat"})).as_deref(), Some("flat"));
        assert_eq!(product_text(&json!({"id": "0a1b"})), None);
    }
}

use super::{Result, StoreError};
use crate::store::Store;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, Response, StatusCode, Url};
use rusty_s3::{actions::ListObjectsV2, Bucket, Credentials, S3Action};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct S3Config {
    pub key: String,
    pub endpoint: String,
    pub secret: String,
    pub token: Option<String>,
    pub bucket: String,
    pub region: String,
    pub bucket_prefix: Option<String>,
}

const PRESIGNED_URL_DURATION: Duration = Duration::from_secs(60 * 60);

pub struct S3Store {
    bucket: Bucket,
    bucket_checked: OnceLock<()>,
    client: Client,
    credentials: Credentials,
    prefix: Option<String>,
}

impl S3Store {
    pub fn new(config: S3Config) -> Result<Self> {
        let credentials = match config.token {
            Some(token) => Credentials::new_with_token(config.key, config.secret, token),
            None => Credentials::new(config.key, config.secret),
        };
        let endpoint: Url = config
            .endpoint
            .parse()
            .map_err(|e| StoreError::InvalidConfig(format!("Invalid S3 endpoint: {}", e)))?;
        let host = endpoint
            .host_str()
            .ok_or_else(|| StoreError::InvalidConfig("S3 endpoint has no host".to_string()))?;
        // A localhost endpoint (minio, localstack) only understands path-style bucket URLs.
        let path_style = if host == "localhost" {
            rusty_s3::UrlStyle::Path
        } else {
            rusty_s3::UrlStyle::VirtualHost
        };
        let bucket = Bucket::new(endpoint, path_style, config.bucket, config.region)
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;

        Ok(S3Store {
            bucket,
            bucket_checked: OnceLock::new(),
            client: Client::new(),
            credentials,
            prefix: config
                .bucket_prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        })
    }

    async fn store_request<'a, A: S3Action<'a>>(
        &self,
        method: Method,
        action: A,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let url = action.sign_with_time(PRESIGNED_URL_DURATION, &OffsetDateTime::now_utc());
        let mut request = self.client.request(method, url);

        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(response),
            StatusCode::NOT_FOUND => Err(StoreError::DoesNotExist(
                "Received NOT_FOUND from S3-compatible API.".to_string(),
            )),
            StatusCode::FORBIDDEN => Err(StoreError::NotAuthorized(
                "Received FORBIDDEN from S3-compatible API.".to_string(),
            )),
            StatusCode::UNAUTHORIZED => Err(StoreError::NotAuthorized(
                "Received UNAUTHORIZED from S3-compatible API.".to_string(),
            )),
            _ => Err(StoreError::ConnectionError(format!(
                "Received {} from S3-compatible API.",
                response.status()
            ))),
        }
    }

    async fn read_response_bytes(response: Response) -> Result<Bytes> {
        response
            .bytes()
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))
    }

    pub async fn init(&self) -> Result<()> {
        if self.bucket_checked.get().is_some() {
            return Ok(());
        }

        let action = self.bucket.head_bucket(Some(&self.credentials));
        match self.store_request(Method::HEAD, action, None).await {
            // A 404 on a bucket HEAD means the bucket itself is missing.
            Err(StoreError::DoesNotExist(_)) => {
                return Err(StoreError::BucketDoesNotExist(
                    "Bucket does not exist.".to_string(),
                ))
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        };

        let _ = self.bucket_checked.set(());
        Ok(())
    }

    fn prefixed_key(&self, key: &str) -> String {
        if let Some(path_prefix) = &self.prefix {
            format!("{}/{}", path_prefix, key)
        } else {
            key.to_string()
        }
    }

    fn unprefixed_key(&self, key: String) -> Option<String> {
        match &self.prefix {
            Some(path_prefix) => key
                .strip_prefix(path_prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .map(str::to_string),
            None => Some(key),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.init().await?;
        let prefixed_key = self.prefixed_key(key);
        let object_get = self
            .bucket
            .get_object(Some(&self.credentials), &prefixed_key);

        match self.store_request(Method::GET, object_get, None).await {
            Ok(response) => {
                let result = Self::read_response_bytes(response).await?;
                Ok(Some(result.to_vec()))
            }
            Err(StoreError::DoesNotExist(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.init().await?;
        let prefixed_key = self.prefixed_key(key);
        let action = self
            .bucket
            .put_object(Some(&self.credentials), &prefixed_key);
        self.store_request(Method::PUT, action, Some(value)).await?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.init().await?;
        let prefixed = self.prefixed_key(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.with_prefix(prefixed.as_str());
            if let Some(token) = &continuation {
                action.with_continuation_token(token.as_str());
            }

            let response = self.store_request(Method::GET, action, None).await?;
            let body = Self::read_response_bytes(response).await?;
            let body = String::from_utf8_lossy(&body);
            let parsed = ListObjectsV2::parse_response(&body).map_err(|e| {
                StoreError::ConnectionError(format!("Malformed ListObjectsV2 response: {}", e))
            })?;

            keys.extend(
                parsed
                    .contents
                    .into_iter()
                    .filter_map(|object| self.unprefixed_key(object.key)),
            );

            match parsed.next_continuation_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl Store for S3Store {
    async fn init(&self) -> Result<()> {
        self.init().await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.set(key, value).await
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_objects(prefix).await
    }
}

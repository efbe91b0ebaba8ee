use crate::{
    api_types::{CachedProduct, RefreshMeta},
    office::{OfficeCode, PAYLOAD_PREFIX},
    store::{Backend, Result, StoreError, StoreHandle},
};
use tracing::warn;

/// Typed access to the per-office payload and metadata records.
pub struct ProductCache {
    store: StoreHandle,
}

impl ProductCache {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Returns the cached payload, treating an empty body as no payload.
    pub async fn get_payload(&self, office: &OfficeCode) -> Result<Option<CachedProduct>> {
        let payload: Option<CachedProduct> = self.store.get_json(&office.payload_key()).await?;
        Ok(payload.filter(|p| {
            let has_text = !p.original_text.trim().is_empty();
            if !has_text {
                warn!(event = "empty_payload", office = %office, "Ignoring cached payload with empty text.");
            }
            has_text
        }))
    }

    pub async fn set_payload(&self, office: &OfficeCode, payload: &CachedProduct) -> Result<Backend> {
        if payload.office != *office {
            return Err(StoreError::InvalidValue(format!(
                "payload for {} cannot be stored under {}",
                payload.office, office
            )));
        }
        if payload.original_text.trim().is_empty() {
            return Err(StoreError::InvalidValue(format!(
                "payload for {} has no text",
                office
            )));
        }
        self.store.set_json(&office.payload_key(), payload).await
    }

    /// Offices that currently have a readable cached payload, sorted.
    ///
    /// Keys whose content `get_payload` would reject are left out, so every
    /// listed office can be served.
    pub async fn list_offices_with_payload(&self) -> Result<Vec<OfficeCode>> {
        let keys = self.store.list_keys(PAYLOAD_PREFIX).await?;
        let mut candidates: Vec<OfficeCode> = keys
            .iter()
            .filter_map(|key| OfficeCode::from_payload_key(key))
            .collect();
        candidates.sort();
        candidates.dedup();

        let mut offices = Vec::with_capacity(candidates.len());
        for office in candidates {
            if self.get_payload(&office).await?.is_some() {
                offices.push(office);
            }
        }
        Ok(offices)
    }

    pub async fn get_meta(&self, office: &OfficeCode) -> Result<RefreshMeta> {
        Ok(self
            .store
            .get_json(&office.meta_key())
            .await?
            .unwrap_or_default())
    }

    pub async fn set_meta(&self, office: &OfficeCode, meta: &RefreshMeta) -> Result<Backend> {
        self.store.set_json(&office.meta_key(), meta).await
    }
}

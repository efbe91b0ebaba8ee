use crate::{
    api_types::{CachedProduct, RefreshMeta, RefreshOutcome, RefreshStatus},
    cache::ProductCache,
    office::OfficeCode,
    upstream::{FetchResponse, ProductFields, Upstream},
};
use anyhow::{bail, Context, Result};
use futures::{stream, StreamExt};
use std::{collections::HashSet, sync::Arc};
use time::OffsetDateTime;
use tracing::{error, info};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Runs the conditional refresh protocol for a configured set of offices.
///
/// Per office: load meta, ask upstream (conditionally when a freshness token
/// is known), then reconcile the answer with what is cached. The payload is
/// always written before the meta that references it.
///
/// Two refreshes of the same office running at once (say, the scheduler and
/// a manual trigger) are not serialized against each other; the last meta
/// write wins.
pub struct Refresher {
    cache: Arc<ProductCache>,
    upstream: Arc<dyn Upstream>,
    offices: Vec<OfficeCode>,
    concurrency: usize,
}

impl Refresher {
    pub fn new(
        cache: Arc<ProductCache>,
        upstream: Arc<dyn Upstream>,
        offices: Vec<OfficeCode>,
    ) -> Self {
        let mut seen = HashSet::new();
        let offices = offices
            .into_iter()
            .filter(|office| seen.insert(office.clone()))
            .collect();

        Self {
            cache,
            upstream,
            offices,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn offices(&self) -> &[OfficeCode] {
        &self.offices
    }

    pub fn cache(&self) -> &Arc<ProductCache> {
        &self.cache
    }

    /// Refreshes every configured office, or only `subset` when given.
    ///
    /// Returns one outcome per requested office, in request order. A failure
    /// is reported in that office's outcome and never stops the batch.
    pub async fn run_refresh(&self, subset: Option<&[String]>, force: bool) -> Vec<RefreshOutcome> {
        let jobs = self.plan(subset);
        info!(
            event = "refresh_started",
            offices = jobs.len(),
            force,
            "Starting refresh batch."
        );

        let outcomes: Vec<RefreshOutcome> = stream::iter(jobs)
            .map(|job| async move {
                match job {
                    Ok(office) => self.refresh_outcome(&office, force).await,
                    Err(outcome) => outcome,
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        info!(
            event = "refresh_finished",
            offices = outcomes.len(),
            updated = outcomes.iter().filter(|o| o.updated).count(),
            failed = outcomes.iter().filter(|o| o.error.is_some()).count(),
            "Finished refresh batch."
        );
        outcomes
    }

    fn plan(&self, subset: Option<&[String]>) -> Vec<std::result::Result<OfficeCode, RefreshOutcome>> {
        let Some(subset) = subset else {
            return self.offices.iter().cloned().map(Ok).collect();
        };

        let mut seen = HashSet::new();
        subset
            .iter()
            .filter_map(|raw| {
                let office = match OfficeCode::parse(raw) {
                    Ok(office) => office,
                    Err(e) => return Some(Err(RefreshOutcome::failed(raw.trim(), e.to_string()))),
                };
                if !seen.insert(office.clone()) {
                    return None;
                }
                if !self.offices.contains(&office) {
                    return Some(Err(RefreshOutcome::failed(
                        office.to_string(),
                        format!("{} is not a configured office.", office),
                    )));
                }
                Some(Ok(office))
            })
            .collect()
    }

    async fn refresh_outcome(&self, office: &OfficeCode, force: bool) -> RefreshOutcome {
        match self.refresh_office(office, force).await {
            Ok(status) => {
                info!(
                    event = "office_refreshed",
                    office = %office,
                    status = ?status,
                    "Refreshed office."
                );
                RefreshOutcome::from_status(office, status)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(
                    event = "office_refresh_failed",
                    office = %office,
                    error = %message,
                    "Failed to refresh office."
                );
                RefreshOutcome::failed(office.to_string(), message)
            }
        }
    }

    pub async fn refresh_office(&self, office: &OfficeCode, force: bool) -> Result<RefreshStatus> {
        let meta = self
            .cache
            .get_meta(office)
            .await
            .context("Failed to read refresh metadata")?;

        let (conditional, known_product_id) = if force {
            (None, None)
        } else {
            (
                meta.last_list_modified.as_deref(),
                meta.last_product_id.as_deref(),
            )
        };

        let response = self
            .upstream
            .fetch_changed(office, conditional, known_product_id)
            .await?;
        let (product, freshness_token) = match response {
            FetchResponse::Content {
                product,
                freshness_token,
            } => (product, freshness_token),
            FetchResponse::NotModified { .. } => {
                if self.has_payload(office).await? {
                    return Ok(RefreshStatus::NotModified);
                }
                match self.backfill_fetch(office).await? {
                    Some(fetched) => fetched,
                    None => return Ok(RefreshStatus::NotModified),
                }
            }
            FetchResponse::Unchanged { freshness_token } => {
                if self.has_payload(office).await? {
                    let last_list_modified =
                        freshness_token.or_else(|| meta.last_list_modified.clone());
                    self.advance_list_modified(office, &meta, last_list_modified)
                        .await?;
                    return Ok(RefreshStatus::NoChange);
                }
                match self.backfill_fetch(office).await? {
                    Some(fetched) => fetched,
                    None => return Ok(RefreshStatus::NotModified),
                }
            }
        };

        self.reconcile(office, meta, product, freshness_token).await
    }

    /// The validators say nothing changed, but the payload is gone (e.g. the
    /// store was wiped). Fetches once without them; `None` if upstream still
    /// answers without a body.
    async fn backfill_fetch(
        &self,
        office: &OfficeCode,
    ) -> Result<Option<(ProductFields, Option<String>)>> {
        info!(
            event = "backfill_fetch",
            office = %office,
            "Upstream unchanged but no payload cached; fetching unconditionally."
        );
        match self.upstream.fetch_latest(office, None).await? {
            FetchResponse::Content {
                product,
                freshness_token,
            } => Ok(Some((product, freshness_token))),
            FetchResponse::NotModified { .. } | FetchResponse::Unchanged { .. } => Ok(None),
        }
    }

    async fn reconcile(
        &self,
        office: &OfficeCode,
        meta: RefreshMeta,
        product: ProductFields,
        freshness_token: Option<String>,
    ) -> Result<RefreshStatus> {
        let last_list_modified = freshness_token.or_else(|| meta.last_list_modified.clone());

        let Some(text) = product.usable_text() else {
            self.advance_list_modified(office, &meta, last_list_modified)
                .await?;
            return Ok(RefreshStatus::NoProduct);
        };

        let known_product = product.id.is_some() && product.id == meta.last_product_id;
        if known_product && self.has_payload(office).await? {
            self.advance_list_modified(office, &meta, last_list_modified)
                .await?;
            return Ok(RefreshStatus::NoChange);
        }

        let payload = CachedProduct {
            office: office.clone(),
            issued: product.issued.clone(),
            product_id: product.id.clone(),
            original_text: text.to_string(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let written_to = self
            .cache
            .set_payload(office, &payload)
            .await
            .context("Failed to write cached payload")?;

        // Reads go to the remote first, so a payload that only reached the
        // local store is invisible there. Meta must not point at it, or the
        // next conditional fetch would pin the older remote payload.
        if written_to != self.cache.store().backend() {
            bail!(
                "Cached payload only reached the {:?} store; metadata left unchanged",
                written_to
            );
        }

        let next = RefreshMeta {
            last_list_modified,
            last_product_id: product.id,
        };
        if next != meta {
            self.cache
                .set_meta(office, &next)
                .await
                .context("Failed to write refresh metadata")?;
        }

        Ok(if known_product {
            RefreshStatus::Backfilled
        } else {
            RefreshStatus::Updated
        })
    }

    async fn has_payload(&self, office: &OfficeCode) -> Result<bool> {
        Ok(self
            .cache
            .get_payload(office)
            .await
            .context("Failed to read cached payload")?
            .is_some())
    }

    /// Moves only `lastListModified` forward, leaving `lastProductId` alone.
    async fn advance_list_modified(
        &self,
        office: &OfficeCode,
        meta: &RefreshMeta,
        last_list_modified: Option<String>,
    ) -> Result<()> {
        if last_list_modified == meta.last_list_modified {
            return Ok(());
        }

        let next = RefreshMeta {
            last_list_modified,
            ..meta.clone()
        };
        self.cache
            .set_meta(office, &next)
            .await
            .context("Failed to write refresh metadata")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{memory::MemoryStore, Store, StoreError, StoreHandle};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    #[derive(Default)]
    struct ScriptedUpstream {
        responses: Mutex<HashMap<String, VecDeque<Result<FetchResponse>>>>,
        requests: Mutex<Vec<(String, Option<String>)>>,
        known_ids: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedUpstream {
        fn push(&self, office: &str, response: Result<FetchResponse>) {
            self.responses
                .lock()
                .unwrap()
                .entry(office.to_string())
                .or_default()
                .push_back(response);
        }

        fn requests(&self) -> Vec<(String, Option<String>)> {
            self.requests.lock().unwrap().clone()
        }

        fn known_ids(&self) -> Vec<Option<String>> {
            self.known_ids.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
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
            self.known_ids
                .lock()
                .unwrap()
                .push(known_product_id.map(str::to_string));
            self.requests
                .lock()
                .unwrap()
                .push((office.to_string(), conditional_token.map(str::to_string)));
            self.responses
                .lock()
                .unwrap()
                .get_mut(office.as_str())
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| Err(anyhow!("no scripted response for {}", office)))
        }
    }

    /// Memory store that counts writes and can be told to reject writes
    /// under a prefix, or every read.
    #[derive(Clone, Default)]
    struct CountingStore {
        inner: MemoryStore,
        writes: Arc<AtomicUsize>,
        reject_prefix: Arc<Mutex<Option<&'static str>>>,
        fail_reads: Arc<AtomicBool>,
    }

    impl CountingStore {
        fn rejecting(prefix: &'static str) -> Self {
            let store = Self::default();
            store.reject_writes(Some(prefix));
            store
        }

        fn reject_writes(&self, prefix: Option<&'static str>) {
            *self.reject_prefix.lock().unwrap() = prefix;
        }
    }

    #[async_trait]
    impl Store for CountingStore {
        async fn get(&self, key: &str) -> crate::store::Result<Option<Vec<u8>>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::ConnectionError("read failed".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> crate::store::Result<()> {
            let reject_prefix = *self.reject_prefix.lock().unwrap();
            if let Some(prefix) = reject_prefix {
                if key.starts_with(prefix) {
                    return Err(StoreError::ConnectionError("write rejected".to_string()));
                }
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value).await
        }

        async fn list_objects(&self, prefix: &str) -> crate::store::Result<Vec<String>> {
            self.inner.list_objects(prefix).await
        }
    }

    struct Fixture {
        store: CountingStore,
        upstream: Arc<ScriptedUpstream>,
        refresher: Refresher,
    }

    impl Fixture {
        fn new(offices: &[&str]) -> Self {
            Self::with_store(CountingStore::default(), offices)
        }

        fn with_store(store: CountingStore, offices: &[&str]) -> Self {
            let upstream = Arc::new(ScriptedUpstream::default());
            let cache = Arc::new(ProductCache::new(StoreHandle::Local(Box::new(
                store.clone(),
            ))));
            let offices = offices.iter().map(|o| office(o)).collect();
            let refresher = Refresher::new(cache, upstream.clone(), offices);
            Self {
                store,
                upstream,
                refresher,
            }
        }

        fn writes(&self) -> usize {
            self.store.writes.load(Ordering::SeqCst)
        }

        async fn seed(&self, code: &str, meta: RefreshMeta, payload: Option<(&str, &str)>) {
            let cache = self.refresher.cache();
            cache.set_meta(&office(code), &meta).await.unwrap();
            if let Some((id, text)) = payload {
                let payload = CachedProduct {
                    office: office(code),
                    issued: Some("2024-05-01T09:00:00+00:00".to_string()),
                    product_id: Some(id.to_string()),
                    original_text: text.to_string(),
                    updated_at: OffsetDateTime::from_unix_timestamp(1_714_554_000).unwrap(),
                };
                cache.set_payload(&office(code), &payload).await.unwrap();
            }
        }

        async fn payload(&self, code: &str) -> Option<CachedProduct> {
            self.refresher
                .cache()
                .get_payload(&office(code))
                .await
                .unwrap()
        }

        async fn meta(&self, code: &str) -> RefreshMeta {
            self.refresher.cache().get_meta(&office(code)).await.unwrap()
        }
    }

    fn office(code: &str) -> OfficeCode {
        OfficeCode::parse(code).unwrap()
    }

    fn meta(token: &str, id: &str) -> RefreshMeta {
        RefreshMeta {
            last_list_modified: Some(token.to_string()),
            last_product_id: Some(id.to_string()),
        }
    }

    fn content(id: Option<&str>, text: Option<&str>, token: Option<&str>) -> Result<FetchResponse> {
        Ok(FetchResponse::Content {
            product: ProductFields {
                id: id.map(str::to_string),
                issued: Some("2024-05-01T10:00:00+00:00".to_string()),
                text: text.map(str::to_string),
            },
            freshness_token: token.map(str::to_string),
        })
    }

    fn not_modified(token: &str) -> Result<FetchResponse> {
        Ok(FetchResponse::NotModified {
            freshness_token: Some(token.to_string()),
        })
    }

    #[tokio::test]
    async fn first_refresh_stores_product_then_meta() {
        let fx = Fixture::new(&["BOX"]);
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1"), Some("tok1")));

        let outcomes = fx.refresher.run_refresh(None, false).await;
        assert_eq!(
            outcomes,
            vec![RefreshOutcome::from_status(&office("BOX"), RefreshStatus::Updated)]
        );

        let payload = fx.payload("BOX").await.unwrap();
        assert_eq!(payload.product_id.as_deref(), Some("P1"));
        assert_eq!(payload.original_text, "T1");
        assert_eq!(fx.meta("BOX").await, meta("tok1", "P1"));
        assert_eq!(fx.upstream.requests(), vec![("BOX".to_string(), None)]);
    }

    #[tokio::test]
    async fn unchanged_upstream_is_idempotent() {
        let fx = Fixture::new(&["BOX"]);
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1"), Some("tok1")));
        fx.upstream.push("BOX", not_modified("tok1"));

        fx.refresher.run_refresh(None, false).await;
        let payload_after_first = fx.payload("BOX").await;
        let meta_after_first = fx.meta("BOX").await;
        let writes_after_first = fx.writes();

        let outcomes = fx.refresher.run_refresh(None, false).await;
        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NotModified));
        assert!(!outcomes[0].updated);
        assert_eq!(fx.payload("BOX").await, payload_after_first);
        assert_eq!(fx.meta("BOX").await, meta_after_first);
        assert_eq!(fx.writes(), writes_after_first);
        assert_eq!(
            fx.upstream.requests()[1],
            ("BOX".to_string(), Some("tok1".to_string()))
        );
    }

    #[tokio::test]
    async fn unchanged_upstream_without_validator_is_no_change() {
        let fx = Fixture::new(&["BOX"]);
        fx.upstream.push("BOX", content(Some("P1"), Some("T1"), None));
        fx.upstream.push("BOX", content(Some("P1"), Some("T1"), None));

        fx.refresher.run_refresh(None, false).await;
        let writes_after_first = fx.writes();
        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NoChange));
        assert_eq!(fx.writes(), writes_after_first);
    }

    #[tokio::test]
    async fn not_modified_with_payload_writes_nothing() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), Some(("P1", "T1"))).await;
        fx.upstream.push("BOX", not_modified("tok1"));
        let before = fx.writes();

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NotModified));
        assert_eq!(fx.writes(), before);
        assert_eq!(fx.upstream.requests().len(), 1);
    }

    #[tokio::test]
    async fn known_product_with_payload_is_no_change() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), Some(("P1", "T1"))).await;
        let cached = fx.payload("BOX").await;
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1 again"), Some("tok2")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NoChange));
        assert!(!outcomes[0].updated);
        assert_eq!(fx.payload("BOX").await, cached);
        assert_eq!(fx.meta("BOX").await, meta("tok2", "P1"));
    }

    #[tokio::test]
    async fn known_product_without_payload_is_backfilled() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), None).await;
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T"), Some("tok2")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(
            outcomes,
            vec![RefreshOutcome::from_status(&office("BOX"), RefreshStatus::Backfilled)]
        );
        let payload = fx.payload("BOX").await.unwrap();
        assert_eq!(payload.original_text, "T");
        assert_eq!(payload.product_id.as_deref(), Some("P1"));
        assert_eq!(fx.meta("BOX").await, meta("tok2", "P1"));
    }

    #[tokio::test]
    async fn not_modified_without_payload_refetches_unconditionally() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), None).await;
        fx.upstream.push("BOX", not_modified("tok1"));
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T"), Some("tok1")));
        let before = fx.writes();

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::Backfilled));
        assert_eq!(
            fx.upstream.requests(),
            vec![
                ("BOX".to_string(), Some("tok1".to_string())),
                ("BOX".to_string(), None),
            ]
        );
        assert_eq!(fx.payload("BOX").await.unwrap().original_text, "T");
        // Meta already described this product, so only the payload is written.
        assert_eq!(fx.writes(), before + 1);
    }

    #[tokio::test]
    async fn backfill_fetch_happens_at_most_once() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), None).await;
        fx.upstream.push("BOX", not_modified("tok1"));
        fx.upstream.push("BOX", not_modified("tok1"));
        fx.upstream.push("BOX", not_modified("tok1"));
        let before = fx.writes();

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NotModified));
        assert_eq!(fx.upstream.requests().len(), 2);
        assert_eq!(fx.writes(), before);
    }

    #[tokio::test]
    async fn new_issuance_replaces_payload() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), Some(("P1", "T1"))).await;
        fx.upstream
            .push("BOX", content(Some("P2"), Some("T2"), Some("tok2")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::Updated));
        assert!(outcomes[0].updated);
        let payload = fx.payload("BOX").await.unwrap();
        assert_eq!(payload.product_id.as_deref(), Some("P2"));
        assert_eq!(payload.original_text, "T2");
        assert_eq!(payload.issued.as_deref(), Some("2024-05-01T10:00:00+00:00"));
        assert_eq!(fx.meta("BOX").await, meta("tok2", "P2"));
    }

    #[tokio::test]
    async fn empty_text_only_advances_freshness_token() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), Some(("P1", "T1"))).await;
        let cached = fx.payload("BOX").await;
        fx.upstream
            .push("BOX", content(Some("P2"), Some("   "), Some("tok2")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NoProduct));
        assert!(!outcomes[0].updated);
        assert_eq!(fx.payload("BOX").await, cached);
        assert_eq!(fx.meta("BOX").await, meta("tok2", "P1"));
    }

    #[tokio::test]
    async fn no_product_without_token_writes_nothing() {
        let fx = Fixture::new(&["BOX"]);
        fx.upstream.push("BOX", content(None, None, None));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NoProduct));
        assert_eq!(fx.writes(), 0);
        assert!(fx.payload("BOX").await.is_none());
    }

    #[tokio::test]
    async fn force_skips_conditional_request() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), Some(("P1", "T1"))).await;
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1"), Some("tok1")));

        let outcomes = fx.refresher.run_refresh(None, true).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NoChange));
        assert_eq!(fx.upstream.requests(), vec![("BOX".to_string(), None)]);
    }

    #[tokio::test]
    async fn failing_office_does_not_stop_batch() {
        let fx = Fixture::new(&["BOX", "OKX", "GYX"]);
        fx.upstream
            .push("BOX", Err(anyhow!("NWS 503: Service Unavailable")));
        fx.upstream
            .push("OKX", content(Some("P1"), Some("T1"), Some("tok1")));
        fx.upstream
            .push("GYX", content(Some("P9"), Some("T9"), Some("tok9")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].office, "BOX");
        assert!(!outcomes[0].updated);
        assert!(outcomes[0].error.as_deref().unwrap().contains("NWS 503"));
        assert_eq!(outcomes[1].office, "OKX");
        assert!(outcomes[1].updated);
        assert_eq!(outcomes[2].office, "GYX");
        assert!(outcomes[2].updated);
        assert_eq!(fx.meta("BOX").await, RefreshMeta::default());
    }

    #[tokio::test]
    async fn subset_is_normalized_deduplicated_and_restricted() {
        let fx = Fixture::new(&["BOX", "OKX"]);
        fx.upstream
            .push("OKX", content(Some("P1"), Some("T1"), Some("tok1")));
        let subset: Vec<String> = ["okx", "OKX", "zzz", "a/b"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let outcomes = fx.refresher.run_refresh(Some(subset.as_slice()), false).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].office, "OKX");
        assert!(outcomes[0].updated);
        assert_eq!(outcomes[1].office, "ZZZ");
        assert!(outcomes[1].error.is_some());
        assert_eq!(outcomes[2].office, "a/b");
        assert!(outcomes[2].error.is_some());
        assert_eq!(fx.upstream.requests().len(), 1);
    }

    #[tokio::test]
    async fn failed_meta_write_leaves_previous_meta() {
        let store = CountingStore::rejecting("afd-meta/");
        let fx = Fixture::with_store(store, &["BOX"]);
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1"), Some("tok1")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert!(outcomes[0].error.is_some());
        assert!(!outcomes[0].updated);
        // The payload landed first; meta never names a product that was not written.
        assert_eq!(
            fx.payload("BOX").await.unwrap().product_id.as_deref(),
            Some("P1")
        );
        assert_eq!(fx.meta("BOX").await, RefreshMeta::default());
    }

    #[tokio::test]
    async fn failed_payload_write_does_not_advance_meta() {
        let store = CountingStore::rejecting("afd/");
        let fx = Fixture::with_store(store, &["BOX"]);
        fx.refresher
            .cache()
            .set_meta(&office("BOX"), &meta("tok1", "P1"))
            .await
            .unwrap();
        fx.upstream
            .push("BOX", content(Some("P2"), Some("T2"), Some("tok2")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert!(outcomes[0]
            .error
            .as_deref()
            .unwrap()
            .contains("Failed to write cached payload"));
        assert_eq!(fx.meta("BOX").await, meta("tok1", "P1"));
    }

    fn unchanged(token: &str) -> Result<FetchResponse> {
        Ok(FetchResponse::Unchanged {
            freshness_token: Some(token.to_string()),
        })
    }

    #[tokio::test]
    async fn known_product_skips_body_download() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), Some(("P1", "T1"))).await;
        fx.upstream.push("BOX", unchanged("tok2"));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NoChange));
        assert_eq!(fx.upstream.known_ids(), vec![Some("P1".to_string())]);
        assert_eq!(fx.meta("BOX").await, meta("tok2", "P1"));
        assert_eq!(fx.payload("BOX").await.unwrap().original_text, "T1");
    }

    #[tokio::test]
    async fn known_product_without_payload_downloads_body() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), None).await;
        fx.upstream.push("BOX", unchanged("tok2"));
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1"), Some("tok2")));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::Backfilled));
        assert_eq!(
            fx.upstream.requests(),
            vec![
                ("BOX".to_string(), Some("tok1".to_string())),
                ("BOX".to_string(), None),
            ]
        );
        assert_eq!(fx.meta("BOX").await, meta("tok2", "P1"));
    }

    #[tokio::test]
    async fn force_sends_no_known_product() {
        let fx = Fixture::new(&["BOX"]);
        fx.seed("BOX", meta("tok1", "P1"), Some(("P1", "T1"))).await;
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1"), Some("tok1")));

        fx.refresher.run_refresh(None, true).await;

        assert_eq!(fx.upstream.known_ids(), vec![None]);
    }

    /// A refresher over a remote store with a local fallback.
    struct FailoverFixture {
        remote: CountingStore,
        local: CountingStore,
        upstream: Arc<ScriptedUpstream>,
        refresher: Refresher,
    }

    impl FailoverFixture {
        fn new() -> Self {
            let remote = CountingStore::default();
            let local = CountingStore::default();
            let upstream = Arc::new(ScriptedUpstream::default());
            let handle = StoreHandle::Remote {
                remote: Box::new(remote.clone()),
                local: Box::new(local.clone()),
            };
            let refresher = Refresher::new(
                Arc::new(ProductCache::new(handle)),
                upstream.clone(),
                vec![office("BOX")],
            );
            Self {
                remote,
                local,
                upstream,
                refresher,
            }
        }
    }

    #[tokio::test]
    async fn payload_landing_only_locally_does_not_advance_meta() {
        let fx = FailoverFixture::new();
        let cache = fx.refresher.cache();
        fx.upstream
            .push("BOX", content(Some("P1"), Some("T1"), Some("tok1")));
        fx.refresher.run_refresh(None, false).await;

        fx.remote.reject_writes(Some("afd/"));
        fx.upstream
            .push("BOX", content(Some("P2"), Some("T2"), Some("tok2")));
        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert!(!outcomes[0].updated);
        assert!(outcomes[0].error.is_some());
        assert_eq!(cache.get_meta(&office("BOX")).await.unwrap(), meta("tok1", "P1"));
        assert!(fx.local.inner.get("afd/BOX").await.unwrap().is_some());

        // Once the remote accepts writes again the new product is picked up,
        // because the stored validator still predates it.
        fx.remote.reject_writes(None);
        fx.upstream
            .push("BOX", content(Some("P2"), Some("T2"), Some("tok2")));
        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::Updated));
        assert_eq!(
            fx.upstream.requests()[2],
            ("BOX".to_string(), Some("tok1".to_string()))
        );
        let served = cache.get_payload(&office("BOX")).await.unwrap().unwrap();
        let stored_meta = cache.get_meta(&office("BOX")).await.unwrap();
        assert_eq!(served.product_id, stored_meta.last_product_id);
        assert_eq!(served.original_text, "T2");
    }

    #[tokio::test]
    async fn failed_remote_reads_are_served_locally() {
        let fx = FailoverFixture::new();
        let local = StoreHandle::Local(Box::new(fx.local.clone()));
        let local_cache = ProductCache::new(local);
        local_cache
            .set_meta(&office("BOX"), &meta("tok1", "P1"))
            .await
            .unwrap();
        local_cache
            .set_payload(
                &office("BOX"),
                &CachedProduct {
                    office: office("BOX"),
                    issued: None,
                    product_id: Some("P1".to_string()),
                    original_text: "T1".to_string(),
                    updated_at: OffsetDateTime::now_utc(),
                },
            )
            .await
            .unwrap();
        fx.remote.fail_reads.store(true, Ordering::SeqCst);
        fx.upstream.push("BOX", not_modified("tok1"));

        let outcomes = fx.refresher.run_refresh(None, false).await;

        assert_eq!(outcomes[0].reason, Some(RefreshStatus::NotModified));
        assert_eq!(
            fx.upstream.requests(),
            vec![("BOX".to_string(), Some("tok1".to_string()))]
        );
        assert_eq!(fx.remote.writes.load(Ordering::SeqCst), 0);
    }
}

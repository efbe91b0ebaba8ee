use super::{Result, Store, StoreError};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use tracing::{info, warn};

/// Which backend served (or accepted) a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Remote,
    Local,
}

/// The store the rest of the process talks to.
///
/// Built once at startup by [`StoreHandle::select`]. If the remote backend
/// could not be initialized the handle is `Local` for the rest of the
/// process; a `Remote` handle keeps the local backend around so individual
/// calls can fail over to it.
pub enum StoreHandle {
    Remote {
        remote: Box<dyn Store>,
        local: Box<dyn Store>,
    },
    Local(Box<dyn Store>),
}

impl StoreHandle {
    pub async fn select(remote: Option<Box<dyn Store>>, local: Box<dyn Store>) -> Result<Self> {
        local.init().await?;

        let Some(remote) = remote else {
            info!(
                event = "store_selected",
                backend = "local",
                "No remote store configured; using local store."
            );
            return Ok(Self::Local(local));
        };

        match remote.init().await {
            Ok(()) => {
                info!(event = "store_selected", backend = "remote", "Using remote store.");
                Ok(Self::Remote { remote, local })
            }
            Err(e) => {
                warn!(
                    event = "store_selected",
                    backend = "local",
                    error = %e,
                    "Remote store failed to initialize; using local store for this process."
                );
                Ok(Self::Local(local))
            }
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Remote { .. } => Backend::Remote,
            Self::Local(_) => Backend::Local,
        }
    }

    /// Runs `call` against the preferred backend, retrying once on the local
    /// backend if the remote call fails.
    async fn with_failover<'a, T, F, Fut>(
        &'a self,
        op: &'static str,
        key: &str,
        call: F,
    ) -> Result<(T, Backend)>
    where
        F: Fn(&'a dyn Store) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        match self {
            Self::Local(local) => Ok((call(local.as_ref()).await?, Backend::Local)),
            Self::Remote { remote, local } => match call(remote.as_ref()).await {
                Ok(value) => Ok((value, Backend::Remote)),
                Err(remote_err) => {
                    warn!(
                        event = "store_failover",
                        op,
                        key,
                        error = %remote_err,
                        "Remote store call failed; retrying on local store."
                    );
                    match call(local.as_ref()).await {
                        Ok(value) => Ok((value, Backend::Local)),
                        Err(local_err) => Err(StoreError::Unavailable {
                            remote: Box::new(remote_err),
                            local: Box::new(local_err),
                        }),
                    }
                }
            },
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (value, _) = self
            .with_failover("get", key, |store| store.get(key))
            .await?;
        Ok(value)
    }

    /// Writes `value` and reports which backend holds it.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<Backend> {
        let (_, backend) = self
            .with_failover("set", key, |store| store.set(key, value.clone()))
            .await?;
        Ok(backend)
    }

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let (mut keys, _) = self
            .with_failover("list", prefix, |store| store.list_objects(prefix))
            .await?;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Reads and decodes a JSON value. Unreadable content counts as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(
                    event = "store_value_unreadable",
                    key,
                    error = %e,
                    "Ignoring malformed stored value."
                );
                Ok(None)
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<Backend> {
        let body = serde_json::to_vec(value)?;
        self.set(key, body).await
    }
}

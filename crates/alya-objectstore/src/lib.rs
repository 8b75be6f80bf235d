//! Object store facade (§4.C): put/get/delete binary artifacts by (bucket,
//! key). Errors surface verbatim; only the 3-attempt exponential-backoff
//! retry (§7) is applied here, mirroring `alya_db::retry`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::{path::Path as ObjectPath, ObjectStore};

pub const ENV_BUCKET: &str = "ALYA_OBJECT_STORE_BUCKET";
pub const ENV_LOCAL_ROOT: &str = "ALYA_OBJECT_STORE_PATH";

pub const DEFAULT_BUCKET: &str = "batch-output";

#[derive(Debug)]
pub enum ObjectStoreError {
    NotFound,
    ObjectStoreUnavailable(String),
}

impl fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreError::NotFound => write!(f, "OBJECTSTORE_NOT_FOUND: no object at key"),
            ObjectStoreError::ObjectStoreUnavailable(detail) => {
                write!(f, "OBJECTSTORE_UNAVAILABLE: {detail}")
            }
        }
    }
}

impl std::error::Error for ObjectStoreError {}

impl From<object_store::Error> for ObjectStoreError {
    fn from(err: object_store::Error) -> Self {
        match &err {
            object_store::Error::NotFound { .. } => ObjectStoreError::NotFound,
            other => ObjectStoreError::ObjectStoreUnavailable(other.to_string()),
        }
    }
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

const BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(400),
    Duration::from_millis(1600),
];

async fn with_backoff<T, F, Fut>(mut op: F) -> ObjectStoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ObjectStoreResult<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(ObjectStoreError::ObjectStoreUnavailable(msg)) => {
                if attempt >= BACKOFF.len() {
                    return Err(ObjectStoreError::ObjectStoreUnavailable(msg));
                }
                tokio::time::sleep(BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

/// A thin facade over one `object_store::ObjectStore` instance, scoped to a
/// single deployment bucket (§6: "one bucket per deployment, default
/// `batch-output`"; objects keyed `{batch_id}/{logical-name}`).
pub struct ObjectStoreFacade {
    bucket: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreFacade {
    pub fn new(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.into(),
            store,
        }
    }

    /// Connect using `ALYA_OBJECT_STORE_PATH` (a local filesystem root) when
    /// set, otherwise default to `./data/objects` for development. Swap the
    /// backend in by constructing a different `ObjectStore` and calling
    /// `new` directly (e.g. an S3-backed store for production).
    pub fn connect_from_env() -> anyhow::Result<Self> {
        let bucket = std::env::var(ENV_BUCKET).unwrap_or_else(|_| DEFAULT_BUCKET.to_string());
        let root = std::env::var(ENV_LOCAL_ROOT).unwrap_or_else(|_| "./data/objects".to_string());
        let store = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
        Ok(Self::new(bucket, Arc::new(store)))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn path(&self, key: &str) -> ObjectPath {
        ObjectPath::from(key)
    }

    pub async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: Option<&str>,
    ) -> ObjectStoreResult<()> {
        let path = self.path(key);
        with_backoff(|| {
            let store = self.store.clone();
            let path = path.clone();
            let bytes = bytes.clone();
            async move {
                store
                    .put(&path, bytes.into())
                    .await
                    .map(|_| ())
                    .map_err(ObjectStoreError::from)
            }
        })
        .await
    }

    pub async fn get(&self, key: &str) -> ObjectStoreResult<Bytes> {
        let path = self.path(key);
        with_backoff(|| {
            let store = self.store.clone();
            let path = path.clone();
            async move {
                let result = store.get(&path).await.map_err(ObjectStoreError::from)?;
                result.bytes().await.map_err(ObjectStoreError::from)
            }
        })
        .await
    }

    /// Best-effort delete — used in the loser branch of §4.H step 5 to
    /// discard objects from a summarization attempt that lost the race.
    pub async fn delete(&self, key: &str) -> ObjectStoreResult<()> {
        let path = self.path(key);
        with_backoff(|| {
            let store = self.store.clone();
            let path = path.clone();
            async move { store.delete(&path).await.map_err(ObjectStoreError::from) }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let facade = ObjectStoreFacade::new("test-bucket", Arc::new(InMemory::new()));
        facade
            .put("batch-1/log", Bytes::from_static(b"row 1\nrow 2\n"), None)
            .await
            .unwrap();
        let got = facade.get("batch-1/log").await.unwrap();
        assert_eq!(got, Bytes::from_static(b"row 1\nrow 2\n"));
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let facade = ObjectStoreFacade::new("test-bucket", Arc::new(InMemory::new()));
        let err = facade.get("does/not/exist").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound));
    }

    #[tokio::test]
    async fn delete_is_best_effort_idempotent_on_missing_key() {
        let facade = ObjectStoreFacade::new("test-bucket", Arc::new(InMemory::new()));
        facade
            .put("batch-1/log", Bytes::from_static(b"data"), None)
            .await
            .unwrap();
        facade.delete("batch-1/log").await.unwrap();
        let err = facade.get("batch-1/log").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound));
    }
}

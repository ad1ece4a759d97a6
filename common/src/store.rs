use std::sync::Arc;

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{
    memory::InMemory, path::Path, prefix::PrefixStore, ListResult, ObjectMeta, ObjectStore,
};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

/// A wrapper around an `ObjectStore` rooted at the configured export prefix.
/// Beyond a plain `ObjectStore` it:
/// - Keeps track of the URL of the store, which the query engine needs for
///   object-store registration and for building per-file URLs.
/// - Handles the prefix so discovery and caching deal in paths relative to
///   the export root.
#[derive(Debug, Clone)]
pub struct Store {
    url: Url,
    prefix: String,
    store: Arc<PrefixStore<Arc<dyn ObjectStore>>>,
    unprefixed: Arc<dyn ObjectStore>,

    /// `bucket` is `None` for in-memory stores.
    bucket: Option<String>,
}

impl Store {
    /// A store over `s3://<bucket>/<prefix>/` using an already-authenticated
    /// client from the provider.
    pub fn for_remote(
        bucket: &str,
        prefix: &str,
        client: Arc<dyn ObjectStore>,
    ) -> Result<Self, url::ParseError> {
        let prefix = prefix.trim_matches('/').to_string();
        let url = match prefix.as_str() {
            "" => Url::parse(&format!("s3://{}/", bucket))?,
            prefix => Url::parse(&format!("s3://{}/{}/", bucket, prefix))?,
        };
        let store = Arc::new(PrefixStore::new(client.clone(), prefix.as_str()));
        Ok(Self {
            url,
            prefix,
            store,
            unprefixed: client,
            bucket: Some(bucket.to_string()),
        })
    }

    pub fn in_memory(prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/').to_string();
        let url = match prefix.as_str() {
            "" => Url::parse("memory://in_memory_store/").unwrap(),
            prefix => Url::parse(&format!("memory://in_memory_store/{}/", prefix)).unwrap(),
        };
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        Self {
            url,
            store: Arc::new(PrefixStore::new(store.clone(), prefix.as_str())),
            prefix,
            unprefixed: store,
            bucket: None,
        }
    }

    /// The URL of the export root, with a trailing slash.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The root URL of the backing store, without the prefix. This is what
    /// gets registered with the engine's object-store registry.
    pub fn root_url(&self) -> Url {
        let mut url = self.url.clone();
        url.set_path("/");
        url
    }

    /// The URL of a single object, given its path relative to the prefix.
    pub fn file_url(&self, suffix: &str) -> Result<Url, url::ParseError> {
        self.url.join(suffix)
    }

    /// A store that resolves paths relative to the configured prefix.
    pub fn prefixed_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// The unprefixed store. Use this with URLs that already carry the prefix.
    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.unprefixed.clone()
    }

    pub async fn put_bytes(
        &self,
        location: impl Into<Path>,
        bytes: impl Into<Bytes>,
    ) -> Result<(), StoreError> {
        self.store.put(&location.into(), bytes.into().into()).await?;
        Ok(())
    }

    pub fn list(&self, prefix: impl Into<Path>) -> BoxStream<'_, Result<ObjectMeta, StoreError>> {
        self.store
            .list(Some(&prefix.into()))
            .map_err(|e| e.into())
            .boxed()
    }

    /// One level of "directories" and objects under `prefix`, via delimiter
    /// listing. This is how partition directories are enumerated.
    pub async fn list_shallow(&self, prefix: Option<&Path>) -> Result<ListResult, StoreError> {
        Ok(self.store.list_with_delimiter(prefix).await?)
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store at {}", self.url)
    }
}

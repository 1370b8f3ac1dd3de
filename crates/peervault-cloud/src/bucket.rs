//! The bucket abstraction: a prefix-keyed object store.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in this page, lexicographically sorted
    pub keys: Vec<String>,
    /// Continuation token for the next page, when more keys exist
    pub next: Option<String>,
}

/// Minimal object-storage interface the sync layer needs. Real backends
/// wrap an HTTP client plus [`crate::SigV4Signer`]; tests use
/// [`MemoryBucket`].
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    /// Read an object, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object, replacing any existing value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete an object. Deleting an absent object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys under `prefix`, one page at a time.
    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage>;
}

/// In-memory bucket with paginated listing.
#[derive(Debug)]
pub struct MemoryBucket {
    objects: DashMap<String, Vec<u8>>,
    page_size: usize,
}

impl MemoryBucket {
    /// Create an empty bucket with the default page size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    /// Create an empty bucket with a custom page size (tests exercise
    /// pagination with small pages).
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: DashMap::new(),
            page_size: page_size.max(1),
        }
    }
}

impl Default for MemoryBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectBucket for MemoryBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.objects.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, continuation: Option<&str>) -> Result<ListPage> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();

        // The continuation token is the last key of the previous page
        let start = match continuation {
            Some(token) => keys.partition_point(|k| k.as_str() <= token),
            None => 0,
        };
        let page: Vec<String> = keys[start..].iter().take(self.page_size).cloned().collect();
        let next = if start + page.len() < keys.len() {
            page.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys: page, next })
    }
}

/// Drain every page of a listing into one vector.
pub async fn list_all(bucket: &dyn ObjectBucket, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = bucket.list(prefix, continuation.as_deref()).await?;
        keys.extend(page.keys);
        match page.next {
            Some(token) => continuation = Some(token),
            None => return Ok(keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let bucket = MemoryBucket::new();
        assert_eq!(bucket.get("k").await.unwrap(), None);
        bucket.put("k", b"v").await.unwrap();
        assert_eq!(bucket.get("k").await.unwrap().unwrap(), b"v");
        bucket.delete("k").await.unwrap();
        assert_eq!(bucket.get("k").await.unwrap(), None);
        bucket.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let bucket = MemoryBucket::with_page_size(2);
        for i in 0..5 {
            bucket
                .put(&format!("pv/deltas/{i:03}"), b"x")
                .await
                .unwrap();
        }
        bucket.put("other/zzz", b"x").await.unwrap();

        let first = bucket.list("pv/", None).await.unwrap();
        assert_eq!(first.keys, vec!["pv/deltas/000", "pv/deltas/001"]);
        assert!(first.next.is_some());

        let second = bucket.list("pv/", first.next.as_deref()).await.unwrap();
        assert_eq!(second.keys, vec!["pv/deltas/002", "pv/deltas/003"]);

        let third = bucket.list("pv/", second.next.as_deref()).await.unwrap();
        assert_eq!(third.keys, vec!["pv/deltas/004"]);
        assert_eq!(third.next, None);
    }

    #[tokio::test]
    async fn test_list_all_drains_pages() {
        let bucket = MemoryBucket::with_page_size(1);
        for name in ["a", "b", "c"] {
            bucket.put(&format!("p/{name}"), b"x").await.unwrap();
        }
        let keys = list_all(&bucket, "p/").await.unwrap();
        assert_eq!(keys, vec!["p/a", "p/b", "p/c"]);
    }
}

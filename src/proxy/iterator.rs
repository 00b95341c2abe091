//! Cluster-wide iterator
//!
//! Walks every partition in order, fetching entries from the partition
//! owner in batches. Forward-only; a failed fetch ends the iteration.

use std::collections::VecDeque;

use futures::stream::{self, Stream};
use serde::Serialize;

use crate::error::{CacheError, Result};
use crate::proxy::cache_proxy::{CacheProxy, CacheType};
use crate::serialization::Data;

/// Default number of entries fetched per round trip.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// A key and its value as returned by iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
}

/// Lazy sequence over all entries of a cache.
pub struct ClusterWideIterator<K, V> {
    proxy: CacheProxy<K, V>,
    batch_size: usize,
    partition_count: u32,
    partition_id: u32,
    /// Last key fetched from the current partition
    cursor: Option<Data>,
    partition_exhausted: bool,
    buffered: VecDeque<(Data, Data)>,
    /// Key of the entry most recently returned
    current: Option<Data>,
    finished: bool,
}

impl<K: CacheType, V: CacheType> ClusterWideIterator<K, V> {
    pub(crate) fn new(proxy: CacheProxy<K, V>, batch_size: usize, partition_count: u32) -> Self {
        Self {
            proxy,
            batch_size,
            partition_count,
            partition_id: 0,
            cursor: None,
            partition_exhausted: false,
            buffered: VecDeque::new(),
            current: None,
            finished: partition_count == 0,
        }
    }

    /// Returns the next entry, or `None` once every partition has been read.
    pub async fn next_entry(&mut self) -> Result<Option<CacheEntry<K, V>>> {
        loop {
            if self.finished {
                return Ok(None);
            }

            if let Some((key, value)) = self.buffered.pop_front() {
                let entry = self.decode(&key, &value);
                if entry.is_err() {
                    self.finished = true;
                }
                self.current = Some(key);
                return entry.map(Some);
            }

            if self.partition_exhausted {
                self.partition_id += 1;
                self.cursor = None;
                self.partition_exhausted = false;
                if self.partition_id >= self.partition_count {
                    self.finished = true;
                    return Ok(None);
                }
            }

            if let Err(err) = self.fetch().await {
                self.finished = true;
                return Err(err);
            }
        }
    }

    async fn fetch(&mut self) -> Result<()> {
        let (entries, exhausted) = self
            .proxy
            .fetch_partition_batch(self.partition_id, self.cursor.clone(), self.batch_size)
            .await?;
        if let Some((last, _)) = entries.last() {
            self.cursor = Some(last.clone());
        }
        self.partition_exhausted = exhausted || entries.is_empty();
        self.buffered.extend(entries);
        Ok(())
    }

    fn decode(&self, key: &Data, value: &Data) -> Result<CacheEntry<K, V>> {
        let ss = self.proxy.serialization();
        Ok(CacheEntry {
            key: ss.to_object(key)?,
            value: ss.to_object(value)?,
        })
    }

    /// Removes the entry most recently returned by `next_entry`.
    pub async fn remove(&mut self) -> Result<bool> {
        let key = self.current.take().ok_or_else(|| {
            CacheError::Validation("no current entry to remove".to_string())
        })?;
        self.proxy.remove_data(key).await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Turns the iterator into a stream. The stream ends after an error.
    pub fn into_stream(self) -> impl Stream<Item = Result<CacheEntry<K, V>>> + Send {
        stream::unfold(self, |mut iter| async move {
            match iter.next_entry().await {
                Ok(Some(entry)) => Some((Ok(entry), iter)),
                Ok(None) => None,
                Err(err) => Some((Err(err), iter)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClientContext, LocalCluster};
    use crate::config::CacheConfig;
    use futures::TryStreamExt;
    use std::sync::Arc;

    async fn filled_proxy(cluster: &Arc<LocalCluster>, count: i64) -> CacheProxy<String, i64> {
        let proxy = CacheProxy::create(
            CacheConfig::new("numbers"),
            ClientContext::from_service(cluster.clone()),
        )
        .await
        .unwrap();
        for i in 0..count {
            proxy.put(&format!("k{:02}", i), &i).await.unwrap();
        }
        proxy
    }

    #[tokio::test]
    async fn test_iterates_every_partition_in_batches() {
        let cluster = Arc::new(LocalCluster::new(2, 8));
        let proxy = filled_proxy(&cluster, 20).await;

        let mut iter = proxy.iterator_with_batch_size(3).unwrap();
        let mut values = Vec::new();
        while let Some(entry) = iter.next_entry().await.unwrap() {
            assert_eq!(entry.key, format!("k{:02}", entry.value));
            values.push(entry.value);
        }
        values.sort_unstable();

        assert_eq!(values, (0..20).collect::<Vec<_>>());
        assert!(iter.is_finished());
        assert!(iter.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_yields_all_entries() {
        let cluster = Arc::new(LocalCluster::new(3, 5));
        let proxy = filled_proxy(&cluster, 7).await;

        let entries: Vec<CacheEntry<String, i64>> =
            proxy.iterator().unwrap().into_stream().try_collect().await.unwrap();

        assert_eq!(entries.len(), 7);
    }

    #[tokio::test]
    async fn test_failure_aborts_iteration() {
        let cluster = Arc::new(LocalCluster::new(2, 4));
        let proxy = filled_proxy(&cluster, 4).await;
        let mut iter = proxy.iterator().unwrap();

        cluster.set_unreachable(true);
        assert!(matches!(
            iter.next_entry().await,
            Err(CacheError::RemoteInvocation(_))
        ));

        cluster.set_unreachable(false);
        assert!(iter.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_current_entry() {
        let cluster = Arc::new(LocalCluster::new(1, 2));
        let proxy = filled_proxy(&cluster, 3).await;
        let mut iter = proxy.iterator().unwrap();

        assert!(matches!(iter.remove().await, Err(CacheError::Validation(_))));

        let first = iter.next_entry().await.unwrap().unwrap();
        assert!(iter.remove().await.unwrap());

        assert_eq!(proxy.get(&first.key).await.unwrap(), None);
        assert_eq!(proxy.size().await.unwrap(), 2);
    }
}

//! Paging back through a subscription's stored articles.
//!
//! There is no index: a subscription remembers the chunk of its newest entry,
//! and the first entry it has in each chunk points at the chunk before.

use tracing::debug;

use crate::catalogue::{GroupId, GroupRef};
use crate::error::{Error, Result};
use crate::packer::{decode_chunk, Entry};
use crate::storage::Storage;

/// One chunk's worth of a subscription's entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub chunk: u64,
    /// Newest first.
    pub entries: Vec<Entry>,
    /// Chunk holding the subscription's next older entries.
    pub next: Option<u64>,
}

pub struct History<'s, S: Storage> {
    storage: &'s S,
    group: GroupId,
    open_chunk: u64,
    latest: bool,
}

impl<'s, S: Storage> History<'s, S> {
    pub fn new(storage: &'s S, group: &GroupRef<'_>) -> Self {
        Self {
            storage,
            group: group.id,
            open_chunk: group.pack_ids,
            latest: group.latest,
        }
    }

    /// Every entry of a chunk, in the order it was written.
    pub async fn chunk(&self, chunk: u64) -> Result<Vec<Entry>> {
        let key = if chunk == self.open_chunk {
            self.group.latest_key(self.latest)
        } else {
            self.group.chunk_key(chunk)
        };
        debug!("Reading chunk {}", key);

        match self.storage.get(&key, chunk == self.open_chunk).await? {
            Some(data) => Ok(decode_chunk(&data)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn page(&self, sub_id: u64, chunk: u64) -> Result<Page> {
        let mut entries: Vec<Entry> = self
            .chunk(chunk)
            .await?
            .into_iter()
            .filter(|e| e.sub_id == sub_id)
            .collect();
        let next = entries.first().and_then(|e| e.prev);
        entries.reverse();

        Ok(Page {
            chunk,
            entries,
            next,
        })
    }

    /// Follow the back-pointers from `start` until the chain ends, reading
    /// at most `limit` pages.
    pub async fn walk(&self, sub_id: u64, start: Option<u64>, limit: usize) -> Result<Vec<Page>> {
        let mut pages = Vec::new();
        let mut current = start;

        while let Some(chunk) = current {
            if pages.len() >= limit {
                break;
            }
            let page = self.page(sub_id, chunk).await?;
            if let Some(next) = page.next {
                if next >= chunk {
                    return Err(Error::Corrupt(format!(
                        "subscription {sub_id} points from chunk {chunk} forward to {next}"
                    )));
                }
            }
            current = page.next;
            pages.push(page);
        }

        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::NewSubscription;
    use crate::session::{OpenOptions, Session};
    use crate::storage::LocalStorage;

    fn entry(sub_id: u64, n: i64) -> Entry {
        Entry {
            sub_id,
            title: format!("Article {n}"),
            content: "<p>some article body text</p>".to_string(),
            link: format!("https://example.com/{sub_id}/{n}"),
            published: n,
            prev: None,
        }
    }

    async fn populated(storage: &LocalStorage) -> (u64, u64) {
        let mut session = Session::open(storage, OpenOptions::writable().package_size_kb(1))
            .await
            .unwrap();
        let mut ids = Vec::new();
        for title in ["A", "B"] {
            ids.push(
                session
                    .catalogue_mut()
                    .add_subscription(NewSubscription {
                        title: title.to_string(),
                        url: format!("https://{title}.example/feed"),
                        ..Default::default()
                    })
                    .unwrap(),
            );
        }
        let entries = (0..120).map(|n| entry(ids[(n % 2) as usize], n)).collect();
        session.pack(GroupId::Root, entries).await.unwrap();
        session.finish(Ok(())).await.unwrap();
        (ids[0], ids[1])
    }

    #[tokio::test]
    async fn test_walk_visits_every_entry_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let (a, _) = populated(&storage).await;

        let session = Session::open(&storage, OpenOptions::read_only()).await.unwrap();
        let catalogue = session.catalogue();
        let group = catalogue.group(GroupId::Root).unwrap();
        let start = catalogue.subscription(a).unwrap().1.last_chunk;
        let history = History::new(&storage, &group);

        let pages = history.walk(a, start, usize::MAX).await.unwrap();
        assert!(pages.len() > 1);
        for pair in pages.windows(2) {
            assert!(pair[1].chunk < pair[0].chunk);
        }
        assert_eq!(pages.last().unwrap().next, None);

        let published: Vec<i64> = pages
            .iter()
            .flat_map(|p| p.entries.iter().map(|e| e.published))
            .collect();
        let expected: Vec<i64> = (0..120).filter(|n| n % 2 == 0).rev().collect();
        assert_eq!(published, expected);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_walk_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let (_, b) = populated(&storage).await;

        let session = Session::open(&storage, OpenOptions::read_only()).await.unwrap();
        let group = session.catalogue().group(GroupId::Root).unwrap();
        let start = session.catalogue().subscription(b).unwrap().1.last_chunk;
        let history = History::new(&storage, &group);

        let pages = history.walk(b, start, 1).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(Some(pages[0].chunk), start);
        assert!(pages[0].next.is_some());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_walk_without_start_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let catalogue = crate::catalogue::Catalogue::default();
        let group = catalogue.group(GroupId::Root).unwrap();

        let history = History::new(&storage, &group);
        assert!(history.walk(1, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forward_pointer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let mut bad = entry(1, 1);
        bad.prev = Some(5);
        let data = crate::packer::compress(
            format!("{}\n", serde_json::to_string(&bad).unwrap()).as_bytes(),
        )
        .unwrap();
        storage.put("2.gz", &data, true).await.unwrap();

        let mut catalogue = crate::catalogue::Catalogue::default();
        catalogue.pack_ids = 9;
        let group = catalogue.group(GroupId::Root).unwrap();
        let history = History::new(&storage, &group);

        let result = history.walk(1, Some(2), 10).await;
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }
}

//! Fetch phase of a run: fan the subscriptions out to a fixed pool of
//! workers, join them all, then apply the outcomes and pack the new entries
//! from the single session owner.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::catalogue::{GroupId, Subscription};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{fingerprint, parse_new_items, FeedItem, FetchError, Fetcher};
use crate::packer::Entry;
use crate::pipeline::{ContentPipeline, PipelineEnv};
use crate::session::Session;
use crate::storage::Storage;

/// Owned snapshot of what a worker needs to know about one subscription.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub group: GroupId,
    pub sub_id: u64,
    pub url: String,
    pub programs: Vec<String>,
    pub fingerprint: Option<u32>,
    pub last_modified: Option<String>,
}

impl FetchJob {
    pub fn new(group: GroupId, sub: &Subscription) -> Self {
        Self {
            group,
            sub_id: sub.id,
            url: sub.url.clone(),
            programs: sub.programs.clone(),
            fingerprint: sub.fingerprint,
            last_modified: sub.last_modified.clone(),
        }
    }
}

/// New items of one subscription, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub items: Vec<FeedItem>,
    pub last_modified: Option<String>,
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub group: GroupId,
    pub sub_id: u64,
    pub result: std::result::Result<FetchedBatch, FetchError>,
}

struct Worker {
    fetcher: Fetcher,
    buffer: Vec<u8>,
    pipeline: ContentPipeline,
}

impl Worker {
    fn new(fetcher: Fetcher, max_download_kb: usize, env: PipelineEnv) -> Self {
        Self {
            fetcher,
            buffer: vec![0; max_download_kb * 1024 + 1],
            pipeline: ContentPipeline::new(env),
        }
    }

    async fn process(&mut self, job: &FetchJob) -> std::result::Result<FetchedBatch, FetchError> {
        let download = self
            .fetcher
            .download(&job.url, job.last_modified.as_deref(), &mut self.buffer)
            .await?;

        let Some(download) = download else {
            debug!("{} not modified", job.url);
            return Ok(FetchedBatch {
                items: Vec::new(),
                last_modified: job.last_modified.clone(),
            });
        };

        let mut items = parse_new_items(&self.buffer[..download.len], job.fingerprint, Utc::now())?;
        for item in &mut items {
            self.pipeline.process(&job.programs, item).await?;
        }

        Ok(FetchedBatch {
            items,
            last_modified: download.last_modified,
        })
    }
}

pub struct Coordinator {
    fetcher: Fetcher,
    workers: usize,
    max_download_kb: usize,
    env: PipelineEnv,
}

impl Coordinator {
    pub fn new(config: &Config) -> Result<Self> {
        let fetcher = Fetcher::new().map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self::with_fetcher(fetcher, config))
    }

    pub fn with_fetcher(fetcher: Fetcher, config: &Config) -> Self {
        Self {
            fetcher,
            workers: config.jobs.max(1),
            max_download_kb: config.max_download_kb,
            env: PipelineEnv {
                output_path: config.output.clone(),
                max_download_kb: config.max_download_kb,
            },
        }
    }

    /// Run every job and wait for all of them. Outcomes come back in
    /// subscription id order.
    pub async fn fetch_all(&self, jobs: Vec<FetchJob>) -> Result<Vec<FetchOutcome>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.workers.min(jobs.len());
        let (tx, rx) = mpsc::channel::<FetchJob>(workers);
        let rx = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for n in 0..workers {
            let rx = rx.clone();
            let mut worker = Worker::new(self.fetcher.clone(), self.max_download_kb, self.env.clone());
            set.spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    debug!("Worker {} fetching {}", n, job.url);
                    let result = worker.process(&job).await;
                    outcomes.push(FetchOutcome {
                        group: job.group,
                        sub_id: job.sub_id,
                        result,
                    });
                }
                outcomes
            });
        }

        for job in jobs {
            if tx.send(job).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(batch) => outcomes.extend(batch),
                Err(e) => return Err(Error::Worker(e.to_string())),
            }
        }

        outcomes.sort_by_key(|o| o.sub_id);
        Ok(outcomes)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: usize,
    pub failed: usize,
    pub new_entries: usize,
}

/// Fetch every subscription (or those of the tag named `scope`) and pack
/// what is new. Per-subscription failures are recorded, not returned.
pub async fn run<S: Storage>(
    session: &mut Session<'_, S>,
    coordinator: &Coordinator,
    scope: Option<&str>,
) -> Result<FetchReport> {
    let jobs: Vec<FetchJob> = {
        let catalogue = session.catalogue();
        let groups = match scope {
            None => catalogue.groups(),
            Some(name) => {
                let id = catalogue
                    .find_tag(name)
                    .ok_or_else(|| Error::Invalid(format!("unknown tag \"{name}\"")))?;
                catalogue.group(GroupId::Tag(id)).into_iter().collect()
            }
        };
        groups
            .iter()
            .flat_map(|g| g.subscriptions.values().map(move |s| FetchJob::new(g.id, s)))
            .collect()
    };

    session.catalogue_mut().last_fetch = Some(Utc::now().timestamp());
    info!("Fetching {} subscriptions", jobs.len());
    let outcomes = coordinator.fetch_all(jobs).await?;

    let mut report = FetchReport::default();
    let mut batches: BTreeMap<GroupId, Vec<Vec<Entry>>> = BTreeMap::new();
    for outcome in outcomes {
        let Some(sub) = session.catalogue_mut().subscription_mut(outcome.sub_id) else {
            continue;
        };

        match outcome.result {
            Ok(batch) => {
                sub.error = None;
                sub.last_modified = batch.last_modified;
                if let Some(newest) = batch.items.first() {
                    sub.fingerprint = Some(fingerprint(&newest.guid));
                }
                report.fetched += 1;
                report.new_entries += batch.items.len();

                let entries = batch
                    .items
                    .into_iter()
                    .map(|item| Entry {
                        sub_id: outcome.sub_id,
                        title: item.title,
                        content: item.content,
                        link: item.link,
                        published: item.published,
                        prev: None,
                    })
                    .collect();
                batches.entry(outcome.group).or_default().push(entries);
            }
            Err(e) => {
                error!("Failed to fetch {}: {}", sub.url, e);
                sub.error = Some(e.to_string());
                report.failed += 1;
            }
        }
    }

    for (group, group_batches) in batches {
        let entries = order_entries(group_batches);
        if entries.is_empty() {
            continue;
        }
        let sealed = session.pack(group, entries).await?;
        debug!("Packed {} ({} chunks sealed)", group.prefix(), sealed);
    }

    info!(
        "Fetched {} subscriptions ({} failed), {} new entries",
        report.fetched, report.failed, report.new_entries
    );
    Ok(report)
}

/// Oldest first across subscriptions. Batches arrive newest first, in
/// subscription id order; entries with equal timestamps keep that order
/// reversed.
pub fn order_entries(batches: Vec<Vec<Entry>>) -> Vec<Entry> {
    let mut entries: Vec<Entry> = batches.into_iter().flatten().collect();
    entries.reverse();
    entries.sort_by_key(|e| e.published);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sub_id: u64, published: i64, title: &str) -> Entry {
        Entry {
            sub_id,
            title: title.to_string(),
            content: String::new(),
            link: String::new(),
            published,
            prev: None,
        }
    }

    mod order_tests {
        use super::*;

        #[test]
        fn test_oldest_first_across_subscriptions() {
            let ordered = order_entries(vec![
                vec![entry(1, 30, "a3"), entry(1, 10, "a1")],
                vec![entry(2, 20, "b2"), entry(2, 5, "b0")],
            ]);
            let titles: Vec<_> = ordered.iter().map(|e| e.title.as_str()).collect();
            assert_eq!(titles, vec!["b0", "a1", "b2", "a3"]);
        }

        #[test]
        fn test_equal_timestamps_keep_reversed_feed_order() {
            let ordered = order_entries(vec![
                vec![entry(1, 7, "newer"), entry(1, 7, "older")],
                vec![entry(2, 7, "other")],
            ]);
            let titles: Vec<_> = ordered.iter().map(|e| e.title.as_str()).collect();
            assert_eq!(titles, vec!["other", "older", "newer"]);
        }

        #[test]
        fn test_empty() {
            assert!(order_entries(vec![vec![], vec![]]).is_empty());
        }
    }

    mod pool_tests {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        const FEED: &str = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel><title>T</title><link>https://example.com</link>
            <description>d</description>
            <item><guid>g-1</guid><title>One</title><description>x</description>
            <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate></item>
            </channel></rss>"#;

        fn config(jobs: usize) -> Config {
            Config {
                jobs,
                ..Config::default()
            }
        }

        fn job(sub_id: u64, url: String) -> FetchJob {
            FetchJob {
                group: GroupId::Root,
                sub_id,
                url,
                programs: vec![],
                fingerprint: None,
                last_modified: None,
            }
        }

        #[tokio::test]
        async fn test_no_jobs() {
            let coordinator = Coordinator::new(&config(4)).unwrap();
            assert!(coordinator.fetch_all(vec![]).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_outcomes_sorted_and_isolated() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/ok"))
                .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/broken"))
                .respond_with(ResponseTemplate::new(500))
                .mount(&server)
                .await;

            let coordinator = Coordinator::new(&config(2)).unwrap();
            let jobs = vec![
                job(5, format!("{}/ok", server.uri())),
                job(2, format!("{}/broken", server.uri())),
                job(9, format!("{}/ok", server.uri())),
            ];
            let outcomes = coordinator.fetch_all(jobs).await.unwrap();

            let ids: Vec<u64> = outcomes.iter().map(|o| o.sub_id).collect();
            assert_eq!(ids, vec![2, 5, 9]);
            assert!(matches!(outcomes[0].result, Err(FetchError::Status(_))));
            assert_eq!(outcomes[1].result.as_ref().unwrap().items.len(), 1);
            assert_eq!(outcomes[2].result.as_ref().unwrap().items[0].guid, "g-1");
        }

        #[tokio::test]
        async fn test_more_jobs_than_workers() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string(FEED))
                .expect(12)
                .mount(&server)
                .await;

            let coordinator = Coordinator::new(&config(3)).unwrap();
            let jobs = (1..=12).map(|n| job(n, format!("{}/f{n}", server.uri()))).collect();
            let outcomes = coordinator.fetch_all(jobs).await.unwrap();
            assert_eq!(outcomes.len(), 12);
            assert!(outcomes.iter().all(|o| o.result.is_ok()));
        }
    }
}

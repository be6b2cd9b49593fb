//! Best-effort background tagging.
//!
//! After a version commits, the version manager may drop an
//! [`EnrichmentJob`] on a bounded queue.  A single worker task drains the
//! queue, asks a [`Classifier`] for labels and links a tag for every label
//! at or above the confidence threshold.  The worker holds its own store
//! handle.  Failures are logged and counted, never retried and never
//! surfaced to the uploader.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::metadata::store::{AssetId, MetadataStore};
use crate::metrics::record_enrichment;
use crate::storage::backend::BlobStore;

/// A label suggested by a classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub name: String,
    /// In `[0, 1]`.
    pub confidence: f32,
}

/// External content classifier.
pub trait Classifier: Send + Sync + 'static {
    fn classify(
        &self,
        data: Bytes,
        content_type: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Label>>> + Send + '_>>;
}

/// One unit of enrichment work.
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub asset_id: AssetId,
    pub blob_key: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    /// The asset was deleted before the job ran.
    Skipped,
    /// Number of new tag associations created.
    Tagged(usize),
}

/// Canonical tag spelling: trimmed, lower-cased, inner whitespace collapsed.
pub fn normalize_tag(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs a single job against its own store handle.
pub struct EnrichmentWorker {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    classifier: Arc<dyn Classifier>,
    threshold: f32,
}

impl EnrichmentWorker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        classifier: Arc<dyn Classifier>,
        threshold: f32,
    ) -> Self {
        Self {
            store,
            blobs,
            classifier,
            threshold,
        }
    }

    /// Classify the job's blob and link qualifying tags.  Idempotent.
    pub async fn process(&self, job: &EnrichmentJob) -> anyhow::Result<EnrichmentOutcome> {
        if self.store.get_asset(job.asset_id).await?.is_none() {
            return Ok(EnrichmentOutcome::Skipped);
        }
        let blob = self.blobs.get(&job.blob_key).await?;
        let labels = self.classifier.classify(blob.data, &job.content_type).await?;

        let mut linked = 0;
        for label in labels.iter().filter(|l| l.confidence >= self.threshold) {
            let name = normalize_tag(&label.name);
            if name.is_empty() {
                continue;
            }
            let tag = self.store.find_or_create_tag(&name).await?;
            if self.store.link_tag(job.asset_id, tag.tag_id).await? {
                linked += 1;
            }
        }
        Ok(EnrichmentOutcome::Tagged(linked))
    }

    /// Run one job on its own task so a panicking classifier costs only
    /// that job.
    async fn run(self: Arc<Self>, job: EnrichmentJob) {
        let asset_id = job.asset_id;
        let task = tokio::spawn(async move { self.process(&job).await });
        match task.await {
            Ok(Ok(EnrichmentOutcome::Skipped)) => {
                record_enrichment("skipped");
                debug!(asset_id, "enrichment skipped, asset gone");
            }
            Ok(Ok(EnrichmentOutcome::Tagged(linked))) => {
                record_enrichment("tagged");
                debug!(asset_id, linked, "enrichment finished");
            }
            Ok(Err(e)) => {
                record_enrichment("failed");
                warn!(asset_id, error = %e, "enrichment failed");
            }
            Err(e) => {
                record_enrichment("failed");
                warn!(asset_id, error = %e, "enrichment job aborted");
            }
        }
    }
}

enum Message {
    Job(EnrichmentJob),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Producer side of the enrichment queue.  Cheap to clone.
#[derive(Clone)]
pub struct EnrichmentQueue {
    sender: mpsc::Sender<Message>,
}

impl EnrichmentQueue {
    /// Spawn the worker task and return the queue feeding it.
    pub fn start(worker: EnrichmentWorker, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel(capacity.max(1));
        let worker = Arc::new(worker);
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    Message::Job(job) => worker.clone().run(job).await,
                    Message::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    Message::Shutdown(ack) => {
                        receiver.close();
                        let _ = ack.send(());
                        break;
                    }
                }
            }
            info!("enrichment worker stopped");
        });
        Self { sender }
    }

    /// Enqueue without waiting.  Returns false if the job was dropped
    /// because the queue is full or stopped.
    pub fn schedule(&self, job: EnrichmentJob) -> bool {
        let asset_id = job.asset_id;
        match self.sender.try_send(Message::Job(job)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_enrichment("dropped");
                warn!(asset_id, "enrichment queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_enrichment("dropped");
                warn!(asset_id, "enrichment worker stopped, job dropped");
                false
            }
        }
    }

    /// Wait until every job enqueued before this call has been handled.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Message::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Finish queued jobs, then stop the worker.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Message::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{StaticClassifier, TestEnv};

    fn classifier(labels: &[(&str, f32)]) -> Arc<dyn Classifier> {
        Arc::new(StaticClassifier::new(labels))
    }

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("  Golden   Retriever "), "golden retriever");
        assert_eq!(normalize_tag("   "), "");
    }

    #[tokio::test]
    async fn test_process_links_confident_labels_once() {
        let env = TestEnv::new().await;
        let (asset_id, blob_key) = env.seed_asset("dog.png").await;
        let worker = EnrichmentWorker::new(
            env.store.clone(),
            env.blobs.clone(),
            classifier(&[("Dog", 0.9), ("dog ", 0.8), ("Cat", 0.2)]),
            0.6,
        );
        let job = EnrichmentJob {
            asset_id,
            blob_key,
            content_type: "image/png".to_string(),
        };
        assert_eq!(
            worker.process(&job).await.unwrap(),
            EnrichmentOutcome::Tagged(1)
        );
        assert_eq!(
            worker.process(&job).await.unwrap(),
            EnrichmentOutcome::Tagged(0)
        );
        let tags: Vec<String> = env
            .store
            .list_tags(asset_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(tags, vec!["dog"]);
    }

    #[tokio::test]
    async fn test_process_skips_deleted_asset() {
        let env = TestEnv::new().await;
        let worker = EnrichmentWorker::new(
            env.store.clone(),
            env.blobs.clone(),
            classifier(&[("dog", 0.9)]),
            0.6,
        );
        let job = EnrichmentJob {
            asset_id: 999,
            blob_key: "gone".to_string(),
            content_type: "image/png".to_string(),
        };
        assert_eq!(
            worker.process(&job).await.unwrap(),
            EnrichmentOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn test_queue_runs_jobs_and_swallows_failures() {
        let env = TestEnv::new().await;
        let (asset_id, blob_key) = env.seed_asset("dog.png").await;
        let worker = EnrichmentWorker::new(
            env.store.clone(),
            env.blobs.clone(),
            classifier(&[("dog", 0.9)]),
            0.6,
        );
        let queue = EnrichmentQueue::start(worker, 4);

        // Missing blob: fails inside the worker, nothing surfaces.
        assert!(queue.schedule(EnrichmentJob {
            asset_id,
            blob_key: "missing".to_string(),
            content_type: "image/png".to_string(),
        }));
        assert!(queue.schedule(EnrichmentJob {
            asset_id,
            blob_key,
            content_type: "image/png".to_string(),
        }));
        queue.flush().await;
        assert_eq!(env.store.list_tags(asset_id).await.unwrap().len(), 1);

        queue.shutdown().await;
        assert!(!queue.schedule(EnrichmentJob {
            asset_id,
            blob_key: "late".to_string(),
            content_type: "image/png".to_string(),
        }));
    }

    /// Labels like [`StaticClassifier`] but panics on one content type.
    struct PanickingClassifier {
        inner: StaticClassifier,
    }

    impl Classifier for PanickingClassifier {
        fn classify(
            &self,
            data: Bytes,
            content_type: &str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Label>>> + Send + '_>> {
            if content_type == "image/x-corrupt" {
                panic!("classifier crashed on corrupt input");
            }
            self.inner.classify(data, content_type)
        }
    }

    #[tokio::test]
    async fn test_worker_survives_classifier_panic() {
        let env = TestEnv::new().await;
        let (asset_id, blob_key) = env.seed_asset("cat.png").await;
        let queue = env.enrichment_queue(Arc::new(PanickingClassifier {
            inner: StaticClassifier::new(&[("cat", 0.9)]),
        }));

        assert!(queue.schedule(EnrichmentJob {
            asset_id,
            blob_key: blob_key.clone(),
            content_type: "image/x-corrupt".to_string(),
        }));
        assert!(queue.schedule(EnrichmentJob {
            asset_id,
            blob_key,
            content_type: "image/png".to_string(),
        }));
        queue.flush().await;

        let tags: Vec<String> = env
            .store
            .list_tags(asset_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(tags, vec!["cat"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_jobs() {
        let (sender, _receiver) = mpsc::channel(1);
        let queue = EnrichmentQueue { sender };
        let job = EnrichmentJob {
            asset_id: 1,
            blob_key: "k".to_string(),
            content_type: "image/png".to_string(),
        };
        assert!(queue.schedule(job.clone()));
        assert!(!queue.schedule(job));
    }
}

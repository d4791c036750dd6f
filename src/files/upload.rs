//! Write-back uploader.
//!
//! Modified files whose last writer closed are queued here; one worker task
//! streams each sparse source file back through the provider, retrying
//! transient failures with bounded backoff and latching terminal failures
//! onto the owning entry.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventSink};
use crate::files::open_file::OpenFile;
use crate::meta::{MetaMap, META_SIZE, META_SOURCE, META_WRITTEN};
use crate::provider::Provider;
use crate::types::{now_ns, StopToken};

const MAX_UPLOAD_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Clonable handle for queueing upload jobs.
#[derive(Clone)]
pub struct UploadQueue {
    tx: async_channel::Sender<Arc<OpenFile>>,
}

impl UploadQueue {
    pub async fn enqueue(&self, file: Arc<OpenFile>) {
        if self.tx.send(file).await.is_err() {
            warn!("upload queue closed; write-back dropped");
        }
    }
}

/// Background write-back worker.
pub struct Uploader {
    provider: Arc<dyn Provider>,
    events: EventSink,
    stop: StopToken,
    rx: async_channel::Receiver<Arc<OpenFile>>,
}

impl Uploader {
    /// Creates the queue handle and spawns the worker task.
    pub fn spawn(
        provider: Arc<dyn Provider>,
        events: EventSink,
        stop: StopToken,
    ) -> (UploadQueue, JoinHandle<()>) {
        let (tx, rx) = async_channel::unbounded();
        let worker = Self { provider, events, stop, rx };
        (UploadQueue { tx }, tokio::spawn(worker.run()))
    }

    async fn run(self) {
        while let Ok(file) = self.rx.recv().await {
            if self.stop.is_stopped() {
                file.release_upload_claim();
                break;
            }
            self.process(&file).await;
            file.release_upload_claim();
        }
    }

    async fn process(&self, file: &Arc<OpenFile>) {
        let Some(cache) = file.cache() else {
            return;
        };
        if !file.is_modified().await || file.is_unlinked().await {
            return;
        }

        let api_path = file.api_path().await;
        let source_path = cache.source_path();
        self.events.raise(Event::UploadBegin {
            api_path: api_path.clone(),
            source_path: source_path.clone(),
        });

        let result = self.upload_with_retry(file, &api_path, &source_path).await;
        if let Ok(()) = &result {
            cache.mark_clean().await;
            file.set_modified(false).await;

            let mut changes = MetaMap::new();
            changes.insert(META_SIZE.to_owned(), cache.file_size().await.to_string());
            changes.insert(META_SOURCE.to_owned(), source_path.clone());
            changes.insert(META_WRITTEN.to_owned(), now_ns().to_string());
            if let Err(err) = self.provider.set_item_meta(&api_path, changes).await {
                warn!(%api_path, ?err, "post-upload meta refresh failed");
            }
        }

        self.events.raise(Event::UploadEnd {
            api_path,
            source_path,
            error: result.err(),
        });
    }

    async fn upload_with_retry(
        &self,
        file: &Arc<OpenFile>,
        api_path: &str,
        source_path: &str,
    ) -> ApiResult<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;

        loop {
            if self.stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }

            match self.provider.upload_file(api_path, source_path, &self.stop).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_terminal() => {
                    warn!(%api_path, ?err, "upload failed permanently");
                    file.set_error(err.clone()).await;
                    return Err(err);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= MAX_UPLOAD_ATTEMPTS {
                        warn!(%api_path, ?err, "upload retries exhausted");
                        return Err(err);
                    }
                    debug!(%api_path, attempt, "upload retry scheduled");
                    self.events.raise(Event::UploadRetry {
                        api_path: api_path.to_owned(),
                        attempt,
                    });
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cachalot::config::MountConfig;
use cachalot::drive::MountDispatcher;
use cachalot::event::EventSink;
use cachalot::provider::memory::MemoryProvider;
use cachalot::provider::Provider;
use tempfile::TempDir;

pub const CHUNK: u64 = 4096;

pub struct Fixture {
    pub tempdir: TempDir,
    pub provider: Arc<MemoryProvider>,
    pub drive: Arc<MountDispatcher>,
    pub config: MountConfig,
    pub events: EventSink,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_provider(Arc::new(MemoryProvider::new())).await
    }

    pub async fn read_only() -> Self {
        Self::with_provider(Arc::new(MemoryProvider::with_read_only(true))).await
    }

    async fn with_provider(provider: Arc<MemoryProvider>) -> Self {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
        provider.init().await;
        let tempdir = TempDir::new().expect("create temp dir");
        let config = MountConfig {
            data_dir: tempdir.path().to_path_buf(),
            cache_dir: tempdir.path().join("cache"),
            chunk_size: CHUNK,
            chunk_timeout_secs: 1,
            ..MountConfig::default()
        };
        let events = EventSink::default();
        let drive = MountDispatcher::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            &config,
            events.clone(),
        );
        Self { tempdir, provider, drive, config, events }
    }

    pub async fn seed(&self, api_path: &str, data: &[u8]) {
        self.provider.seed_file(api_path, data).await.expect("seed file");
    }

    /// Polls `probe` for up to five seconds; panics if it never turns true.
    pub async fn wait_until<F, Fut>(&self, what: &str, mut probe: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if probe().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

/// Deterministic non-repeating byte pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|idx| (idx % 251) as u8).collect()
}

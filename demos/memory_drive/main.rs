//! Walks the drive core through a scripted session over the in-memory
//! provider: create, write, rename with the handle still open, read back,
//! and report volume numbers.

use std::sync::Arc;

use cachalot::config::MountConfig;
use cachalot::drive::{CallerContext, MountDispatcher};
use cachalot::event::EventSink;
use cachalot::provider::memory::MemoryProvider;
use cachalot::provider::Provider;
use cachalot::types::OpenFlags;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let workdir = tempfile::TempDir::new()?;
    let provider = Arc::new(MemoryProvider::new());
    provider.init().await;

    let config = MountConfig {
        data_dir: workdir.path().to_path_buf(),
        cache_dir: workdir.path().join("cache"),
        chunk_size: 4096,
        chunk_timeout_secs: 5,
        ..MountConfig::default()
    };
    let drive = MountDispatcher::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        &config,
        EventSink::default(),
    );
    drive.mounted(workdir.path(), "/mnt/demo").await?;

    let ctx = CallerContext { uid: 1000, gid: 1000 };
    let handle = drive.create(ctx, "/notes.txt", OpenFlags::READ_WRITE, 0o644).await?;
    drive.write(handle, b"chunked, cached, uploaded", 0).await?;

    drive.rename("/notes.txt", "/journal.txt", false).await?;
    let contents = drive.read(handle, 64, 0).await?;
    println!("read through the renamed handle: {}", String::from_utf8_lossy(&contents));

    let dir = drive.opendir("/", None).await?;
    let mut offset = 0;
    while let Ok(item) = drive.readdir(dir, offset).await {
        println!("  {} (dir: {})", item.api_path, item.directory);
        offset += 1;
    }
    drive.releasedir(dir).await?;

    drive.release(handle).await?;

    let info = drive.statfs().await;
    println!("volume: {} items, {} bytes used", info.total_items, info.used_bytes);

    drive.shutdown("/mnt/demo").await;
    drive.unmounted(workdir.path(), "/mnt/demo").await?;
    Ok(())
}

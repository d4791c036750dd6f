mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cachalot::files::evict::EvictionEngine;
use cachalot::meta::META_PINNED;
use cachalot::types::{OpenFlags, StopToken};
use common::{pattern, Fixture, CHUNK};

const FILE_SIZE: usize = 2 * CHUNK as usize;

async fn sweep_with_budget(fixture: &Fixture, budget: u64) {
    let engine = EvictionEngine::new(
        Arc::clone(fixture.drive.table()),
        budget,
        Duration::from_secs(3600),
        StopToken::new(),
    );
    engine.sweep().await;
}

#[tokio::test]
async fn pinned_files_survive_eviction() {
    let fixture = Fixture::new().await;
    fixture.seed("/pin01.txt", &pattern(FILE_SIZE)).await;
    fixture.seed("/nopin01.txt", &pattern(FILE_SIZE)).await;

    let mut changes = HashMap::new();
    changes.insert(META_PINNED.to_owned(), "true".to_owned());
    fixture.drive.set_item_meta("/pin01.txt", changes).await.unwrap();

    let pinned = fixture.drive.open("/pin01.txt", OpenFlags::READ).await.unwrap();
    let plain = fixture.drive.open("/nopin01.txt", OpenFlags::READ).await.unwrap();
    fixture.drive.read(pinned, FILE_SIZE, 0).await.unwrap();
    fixture.drive.read(plain, FILE_SIZE, 0).await.unwrap();

    // both fully resident; the budget only has room for one of them
    sweep_with_budget(&fixture, FILE_SIZE as u64).await;

    let table = fixture.drive.table();
    let pinned_cache = table.get_open_file_by_path("/pin01.txt").unwrap();
    assert_eq!(pinned_cache.cache().unwrap().resident_count().await, 2);

    let plain_cache = table.get_open_file_by_path("/nopin01.txt").unwrap();
    assert_eq!(plain_cache.cache().unwrap().resident_count().await, 0);
}

#[tokio::test]
async fn dirty_chunks_are_never_evicted() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    let handle = fixture
        .drive
        .create(ctx, "/dirty.bin", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, &pattern(FILE_SIZE), 0).await.unwrap();

    sweep_with_budget(&fixture, 0).await;

    let file = fixture.drive.table().get_open_file_by_path("/dirty.bin").unwrap();
    assert_eq!(file.cache().unwrap().resident_count().await, 2);
    assert!(file.cache().unwrap().is_dirty().await);
}

#[tokio::test]
async fn file_level_eviction_drops_closed_entries() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    fixture.seed("/cold.bin", &pattern(FILE_SIZE)).await;

    let handle = fixture.drive.open("/cold.bin", OpenFlags::READ).await.unwrap();
    fixture.drive.read(handle, FILE_SIZE, 0).await.unwrap();
    fixture.drive.release(handle).await.unwrap();

    // a dirty writer keeps the aggregate above budget after the chunk pass,
    // which pushes the sweep into its file-level walk
    let writer = fixture
        .drive
        .create(ctx, "/hot.bin", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(writer, &pattern(FILE_SIZE), 0).await.unwrap();

    sweep_with_budget(&fixture, 0).await;

    let table = fixture.drive.table();
    assert!(table.get_open_file_by_path("/cold.bin").is_none());
    assert!(table.get_open_file_by_path("/hot.bin").is_some());
}

#[tokio::test]
async fn evicted_chunks_redownload_on_demand() {
    let fixture = Fixture::new().await;
    let data = pattern(FILE_SIZE);
    fixture.seed("/bounce.bin", &data).await;

    let handle = fixture.drive.open("/bounce.bin", OpenFlags::READ).await.unwrap();
    fixture.drive.read(handle, FILE_SIZE, 0).await.unwrap();

    sweep_with_budget(&fixture, 0).await;
    let file = fixture.drive.table().get_open_file_by_path("/bounce.bin").unwrap();
    assert_eq!(file.cache().unwrap().resident_count().await, 0);

    // residency rebuilds transparently
    let read = fixture.drive.read(handle, FILE_SIZE, 0).await.unwrap();
    assert_eq!(read, data);
    assert_eq!(file.cache().unwrap().resident_count().await, 2);
}

#[tokio::test]
async fn reaper_retires_idle_clean_entries() {
    let fixture = Fixture::new().await;
    fixture.seed("/idle.bin", &pattern(64)).await;

    let handle = fixture.drive.open("/idle.bin", OpenFlags::READ).await.unwrap();
    fixture.drive.read(handle, 64, 0).await.unwrap();
    fixture.drive.release(handle).await.unwrap();

    let table = fixture.drive.table();
    fixture
        .wait_until("reaper to retire the entry", || async {
            table.get_open_file_by_path("/idle.bin").is_none()
        })
        .await;
}

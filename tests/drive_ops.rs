mod common;

use cachalot::error::ApiError;
use cachalot::types::OpenFlags;
use common::{pattern, Fixture, CHUNK};

#[tokio::test]
async fn small_file_occupies_one_chunk() {
    let fixture = Fixture::new().await;
    let data = pattern(100);
    fixture.seed("/small.txt", &data).await;

    let handle = fixture.drive.open("/small.txt", OpenFlags::READ).await.unwrap();
    let read = fixture.drive.read(handle, CHUNK as usize, 0).await.unwrap();
    assert_eq!(read, data);

    let file = fixture.drive.table().get_open_file_by_path("/small.txt").unwrap();
    let cache = file.cache().unwrap();
    assert_eq!(cache.total_chunks().await, 1);
    assert_eq!(cache.last_chunk_size().await, 100);

    fixture.drive.release(handle).await.unwrap();
}

#[tokio::test]
async fn cross_chunk_read_spans_the_boundary() {
    let fixture = Fixture::new().await;
    let data = pattern(4 * CHUNK as usize);
    fixture.seed("/span.bin", &data).await;

    let handle = fixture.drive.open("/span.bin", OpenFlags::READ).await.unwrap();
    let offset = CHUNK - 3;
    let read = fixture.drive.read(handle, 7, offset).await.unwrap();
    assert_eq!(read.len(), 7);
    assert_eq!(read, &data[offset as usize..offset as usize + 7]);
}

#[tokio::test]
async fn reads_clamp_at_eof() {
    let fixture = Fixture::new().await;
    let size = 32 * CHUNK as usize + 11;
    let data = pattern(size);
    fixture.seed("/tail.bin", &data).await;

    let handle = fixture.drive.open("/tail.bin", OpenFlags::READ).await.unwrap();
    for chunk in 0..32u64 {
        let read =
            fixture.drive.read(handle, CHUNK as usize, chunk * CHUNK).await.unwrap();
        assert_eq!(read.len(), CHUNK as usize);
    }

    let tail = fixture.drive.read(handle, CHUNK as usize, 32 * CHUNK).await.unwrap();
    assert_eq!(tail.len(), 11);
    assert_eq!(tail, &data[32 * CHUNK as usize..]);

    let past = fixture.drive.read(handle, 64, size as u64).await.unwrap();
    assert!(past.is_empty());
    let far_past = fixture.drive.read(handle, 64, size as u64 + 1000).await.unwrap();
    assert!(far_past.is_empty());
}

#[tokio::test]
async fn reverse_order_reads_reconstruct_the_file() {
    let fixture = Fixture::new().await;
    let data = pattern(4 * CHUNK as usize);
    fixture.seed("/reverse.bin", &data).await;

    let handle = fixture.drive.open("/reverse.bin", OpenFlags::READ).await.unwrap();
    let mut rebuilt = vec![0u8; data.len()];
    for chunk in (0..4u64).rev() {
        let offset = chunk * CHUNK;
        let read = fixture.drive.read(handle, CHUNK as usize, offset).await.unwrap();
        rebuilt[offset as usize..offset as usize + read.len()].copy_from_slice(&read);
    }
    assert_eq!(rebuilt, data);
}

#[tokio::test]
async fn random_seeks_match_the_source() {
    let fixture = Fixture::new().await;
    let size = 8 * CHUNK as usize;
    let data = pattern(size);
    fixture.seed("/seek.bin", &data).await;

    let handle = fixture.drive.open("/seek.bin", OpenFlags::READ).await.unwrap();
    let probes: [(usize, u64); 6] = [
        (1, 0),
        (13, CHUNK * 3 - 5),
        (CHUNK as usize, CHUNK / 2),
        (300, 7 * CHUNK + 100),
        (CHUNK as usize * 2, CHUNK * 5),
        (17, size as u64 - 17),
    ];
    for (probe_size, offset) in probes {
        let read = fixture.drive.read(handle, probe_size, offset).await.unwrap();
        assert_eq!(read, &data[offset as usize..offset as usize + probe_size]);
    }
}

#[tokio::test]
async fn writes_are_visible_through_every_handle() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    let writer = fixture
        .drive
        .create(ctx, "/shared.txt", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    let reader = fixture.drive.open("/shared.txt", OpenFlags::READ).await.unwrap();

    let payload = pattern(CHUNK as usize + 77);
    let written = fixture.drive.write(writer, &payload, 0).await.unwrap();
    assert_eq!(written, payload.len());

    let read = fixture.drive.read(reader, payload.len(), 0).await.unwrap();
    assert_eq!(read, payload);
}

#[tokio::test]
async fn append_handles_always_write_at_eof() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    let handle = fixture
        .drive
        .create(ctx, "/log.txt", OpenFlags::WRITE.with_append(), 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, b"first|", 0).await.unwrap();
    // offset is ignored for append handles
    fixture.drive.write(handle, b"second", 0).await.unwrap();

    let reader = fixture.drive.open("/log.txt", OpenFlags::READ).await.unwrap();
    let read = fixture.drive.read(reader, 64, 0).await.unwrap();
    assert_eq!(read, b"first|second");
}

#[tokio::test]
async fn close_writes_back_to_the_provider() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    let payload = pattern(2 * CHUNK as usize + 9);

    let handle = fixture
        .drive
        .create(ctx, "/upload.bin", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, &payload, 0).await.unwrap();
    fixture.drive.release(handle).await.unwrap();

    let provider = std::sync::Arc::clone(&fixture.provider);
    fixture
        .wait_until("write-back to finish", || {
            let provider = std::sync::Arc::clone(&provider);
            let expected = payload.clone();
            async move {
                use cachalot::provider::Provider as _;
                let mut data = Vec::new();
                let stop = cachalot::types::StopToken::new();
                provider
                    .read_file_bytes("/upload.bin", expected.len(), 0, &mut data, &stop)
                    .await
                    .map(|_| data == expected)
                    .unwrap_or(false)
            }
        })
        .await;
}

#[tokio::test]
async fn truncate_shrinks_and_extends() {
    let fixture = Fixture::new().await;
    let data = pattern(3 * CHUNK as usize);
    fixture.seed("/resize.bin", &data).await;

    let handle = fixture.drive.open("/resize.bin", OpenFlags::READ_WRITE).await.unwrap();
    fixture.drive.read(handle, data.len(), 0).await.unwrap();

    fixture.drive.ftruncate(handle, CHUNK + 10).await.unwrap();
    let read = fixture.drive.read(handle, data.len(), 0).await.unwrap();
    assert_eq!(read.len(), CHUNK as usize + 10);
    assert_eq!(read, &data[..CHUNK as usize + 10]);

    fixture.drive.ftruncate(handle, 2 * CHUNK).await.unwrap();
    let read = fixture.drive.read(handle, data.len(), 0).await.unwrap();
    assert_eq!(read.len(), 2 * CHUNK as usize);
    assert_eq!(&read[..CHUNK as usize + 10], &data[..CHUNK as usize + 10]);
    assert!(read[CHUNK as usize + 10..].iter().all(|byte| *byte == 0));
}

#[tokio::test]
async fn reopening_a_clean_file_preserves_content() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    let payload = pattern(CHUNK as usize * 2);

    let handle = fixture
        .drive
        .create(ctx, "/persist.bin", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, &payload, 0).await.unwrap();
    fixture.drive.release(handle).await.unwrap();

    let table = fixture.drive.table();
    fixture
        .wait_until("entry to retire", || async {
            table.get_open_file_by_path("/persist.bin").is_none()
        })
        .await;

    let reopened = fixture.drive.open("/persist.bin", OpenFlags::READ).await.unwrap();
    let read = fixture.drive.read(reopened, payload.len(), 0).await.unwrap();
    assert_eq!(read, payload);
    assert_eq!(
        fixture.drive.fgetattr(reopened).await.unwrap().0.st_size,
        payload.len() as u64
    );
}

#[tokio::test]
async fn read_only_provider_refuses_writers() {
    let fixture = Fixture::read_only().await;
    fixture.seed("/ro.txt", b"fixed").await;

    let err = fixture.drive.open("/ro.txt", OpenFlags::READ_WRITE).await.unwrap_err();
    assert_eq!(err, ApiError::PermissionDenied);

    let handle = fixture.drive.open("/ro.txt", OpenFlags::READ).await.unwrap();
    assert_eq!(fixture.drive.read(handle, 16, 0).await.unwrap(), b"fixed");
}

#[tokio::test]
async fn create_honors_exclusive_and_kind() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    fixture.drive.mkdir(ctx, "/adir", 0o755).await.unwrap();
    let err = fixture
        .drive
        .create(ctx, "/adir", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::DirectoryExists);

    let handle = fixture
        .drive
        .create(ctx, "/once.txt", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.release(handle).await.unwrap();

    let err = fixture
        .drive
        .create(ctx, "/once.txt", OpenFlags::READ_WRITE.with_exclusive(), 0o644)
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::ItemExists);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_readers_coalesce_on_one_download() {
    let fixture = Fixture::new().await;
    let data = pattern(CHUNK as usize);
    fixture.seed("/hot.bin", &data).await;

    let handle = fixture.drive.open("/hot.bin", OpenFlags::READ).await.unwrap();
    let mut events = fixture.events.subscribe();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let drive = std::sync::Arc::clone(&fixture.drive);
        tasks.push(tokio::spawn(async move { drive.read(handle, CHUNK as usize, 0).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), data);
    }

    let mut downloads = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, cachalot::event::Event::DownloadBegin { .. }) {
            downloads += 1;
        }
    }
    assert_eq!(downloads, 1);
}

#[tokio::test]
async fn write_only_handles_cannot_read() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    let handle = fixture
        .drive
        .create(ctx, "/wo.txt", OpenFlags::WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, b"data", 0).await.unwrap();
    assert_eq!(
        fixture.drive.read(handle, 4, 0).await.unwrap_err(),
        ApiError::InvalidHandle
    );
}

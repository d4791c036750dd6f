mod common;

use std::collections::HashMap;

use cachalot::drive::{CallerContext, R_OK, W_OK};
use cachalot::error::ApiError;
use cachalot::meta::{META_MODE, META_UID, META_USED_NAMES};
use common::{pattern, Fixture};

#[tokio::test]
async fn non_reserved_meta_round_trips() {
    let fixture = Fixture::new().await;
    fixture.seed("/meta.txt", b"x").await;

    let key = cachalot::meta::xattr_meta_key("user.color");
    let mut changes = HashMap::new();
    changes.insert(key.clone(), "teal".to_owned());
    fixture.drive.set_item_meta("/meta.txt", changes).await.unwrap();

    let meta = fixture.drive.get_item_meta("/meta.txt").await.unwrap();
    assert_eq!(meta.get(&key).map(String::as_str), Some("teal"));

    fixture.drive.remove_item_meta("/meta.txt", &key).await.unwrap();
    let meta = fixture.drive.get_item_meta("/meta.txt").await.unwrap();
    assert!(!meta.contains_key(&key));
}

#[tokio::test]
async fn reserved_meta_keys_cannot_be_removed() {
    let fixture = Fixture::new().await;
    fixture.seed("/locked.txt", b"x").await;

    let before = fixture.drive.get_item_meta("/locked.txt").await.unwrap();
    for key in META_USED_NAMES {
        assert_eq!(
            fixture.drive.remove_item_meta("/locked.txt", key).await.unwrap_err(),
            ApiError::PermissionDenied
        );
    }
    let after = fixture.drive.get_item_meta("/locked.txt").await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn extended_timestamps_round_trip() {
    let fixture = Fixture::new().await;
    fixture.seed("/times.txt", b"x").await;

    fixture.drive.setbkuptime("/times.txt", 111_222_333).await.unwrap();
    fixture.drive.setcrtime("/times.txt", 444_555_666).await.unwrap();
    fixture.drive.setchgtime("/times.txt", 777_888_999).await.unwrap();

    let (backup, creation) = fixture.drive.getxtimes("/times.txt").await.unwrap();
    assert_eq!(backup, 111_222_333);
    assert_eq!(creation, 444_555_666);

    let (stat, _) = fixture.drive.getattr("/times.txt").await.unwrap();
    assert_eq!(stat.st_ctimespec, 777_888_999);
}

#[tokio::test]
async fn access_honors_stored_mode_and_root_bypass() {
    let fixture = Fixture::new().await;
    fixture.seed("/secret.txt", b"x").await;

    let mut changes = HashMap::new();
    changes.insert(META_MODE.to_owned(), 0o600.to_string());
    changes.insert(META_UID.to_owned(), "1000".to_owned());
    fixture.drive.set_item_meta("/secret.txt", changes).await.unwrap();

    let owner = CallerContext { uid: 1000, gid: 1000 };
    fixture.drive.access(owner, "/secret.txt", R_OK | W_OK).await.unwrap();

    let stranger = CallerContext { uid: 2000, gid: 2000 };
    assert_eq!(
        fixture.drive.access(stranger, "/secret.txt", R_OK).await.unwrap_err(),
        ApiError::PermissionDenied
    );

    let root = CallerContext { uid: 0, gid: 0 };
    fixture.drive.access(root, "/secret.txt", R_OK | W_OK).await.unwrap();

    assert_eq!(
        fixture.drive.access(owner, "/missing.txt", R_OK).await.unwrap_err(),
        ApiError::ItemNotFound
    );
}

#[tokio::test]
async fn getattr_reports_kind_and_size() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    let data = pattern(300);
    fixture.seed("/plain.bin", &data).await;
    fixture.drive.mkdir(ctx, "/somedir", 0o755).await.unwrap();

    let (stat, directory) = fixture.drive.getattr("/plain.bin").await.unwrap();
    assert!(!directory);
    assert_eq!(stat.st_size, 300);
    assert_eq!(stat.st_nlink, 1);

    let (_, directory) = fixture.drive.getattr("/somedir").await.unwrap();
    assert!(directory);

    assert_eq!(
        fixture.drive.getattr("/nope").await.unwrap_err(),
        ApiError::ItemNotFound
    );
}

#[tokio::test]
async fn statfs_aggregates_provider_numbers() {
    let fixture = Fixture::new().await;
    fixture.seed("/one.bin", &pattern(1000)).await;
    fixture.seed("/two.bin", &pattern(500)).await;

    let info = fixture.drive.statfs().await;
    assert_eq!(info.used_bytes, 1500);
    assert!(info.total_bytes > info.used_bytes);
    assert_eq!(info.free_bytes, info.total_bytes - info.used_bytes);
    // root plus the two files
    assert_eq!(info.total_items, 3);
}

#[tokio::test]
async fn mount_lifecycle_records_lock_state() {
    let fixture = Fixture::new().await;
    fixture.drive.mounted(fixture.tempdir.path(), "/mnt/spot").await.unwrap();

    let lock = cachalot::lock::MountLock::new(fixture.tempdir.path());
    let state = lock.read_state().await.unwrap();
    assert!(state.active);
    assert_eq!(state.location, "/mnt/spot");
    assert_eq!(state.pid, std::process::id());

    fixture.drive.unmounted(fixture.tempdir.path(), "/mnt/spot").await.unwrap();
    assert!(!lock.read_state().await.unwrap().active);
}

#[tokio::test]
async fn shutdown_cancels_writers() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    let handle = fixture
        .drive
        .create(ctx, "/late.txt", cachalot::types::OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();

    let mut events = fixture.events.subscribe();
    fixture.drive.shutdown("/mnt/spot").await;

    assert_eq!(events.recv().await.unwrap(), cachalot::event::Event::UnmountRequested);
    assert_eq!(
        fixture.drive.write(handle, b"too late", 0).await.unwrap_err(),
        ApiError::DownloadStopped
    );
}

#[tokio::test]
async fn xattr_surface_is_stubbed() {
    let fixture = Fixture::new().await;
    fixture.seed("/x.txt", b"x").await;

    assert_eq!(
        fixture.drive.getxattr("/x.txt", "user.a").await.unwrap_err(),
        ApiError::NotSupported
    );
    assert_eq!(
        fixture.drive.setxattr("/x.txt", "user.a", b"v").await.unwrap_err(),
        ApiError::NotSupported
    );
}

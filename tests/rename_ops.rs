mod common;

use cachalot::error::ApiError;
use cachalot::types::OpenFlags;
use common::{pattern, Fixture};

#[tokio::test]
async fn rename_follows_open_handles() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    let payload = pattern(128);

    let handle = fixture
        .drive
        .create(ctx, "/rn_src.txt", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, &payload, 0).await.unwrap();

    fixture.drive.rename("/rn_src.txt", "/rn_dst.txt", false).await.unwrap();

    let file = fixture.drive.table().get_open_file(handle).unwrap();
    assert_eq!(file.api_path().await, "/rn_dst.txt");
    assert_eq!(fixture.drive.read(handle, 128, 0).await.unwrap(), payload);

    use cachalot::provider::Provider as _;
    assert!(!fixture.provider.is_file("/rn_src.txt").await.unwrap());
    assert!(fixture.provider.is_file("/rn_dst.txt").await.unwrap());
}

#[tokio::test]
async fn rename_there_and_back_restores_everything() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    let payload = pattern(64);

    let handle = fixture
        .drive
        .create(ctx, "/orig.txt", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, &payload, 0).await.unwrap();

    fixture.drive.rename("/orig.txt", "/moved.txt", false).await.unwrap();
    fixture.drive.rename("/moved.txt", "/orig.txt", false).await.unwrap();

    let file = fixture.drive.table().get_open_file(handle).unwrap();
    assert_eq!(file.api_path().await, "/orig.txt");
    assert_eq!(fixture.drive.read(handle, 64, 0).await.unwrap(), payload);

    use cachalot::provider::Provider as _;
    assert!(fixture.provider.is_file("/orig.txt").await.unwrap());
    assert!(!fixture.provider.is_file("/moved.txt").await.unwrap());
}

#[tokio::test]
async fn rename_refusals() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    fixture.seed("/a.txt", b"a").await;
    fixture.seed("/b.txt", b"b").await;
    fixture.drive.mkdir(ctx, "/dir", 0o755).await.unwrap();

    assert_eq!(
        fixture.drive.rename("/a.txt", "/dir", false).await.unwrap_err(),
        ApiError::DirectoryExists
    );
    assert_eq!(
        fixture.drive.rename("/a.txt", "/b.txt", false).await.unwrap_err(),
        ApiError::ItemExists
    );
    assert_eq!(
        fixture.drive.rename("/ghost.txt", "/c.txt", false).await.unwrap_err(),
        ApiError::ItemNotFound
    );

    // with replace_if_exists the overwrite goes through
    fixture.drive.rename("/a.txt", "/b.txt", true).await.unwrap();
    let handle = fixture.drive.open("/b.txt", OpenFlags::READ).await.unwrap();
    assert_eq!(fixture.drive.read(handle, 8, 0).await.unwrap(), b"a");
}

#[tokio::test]
async fn directory_rename_rewrites_open_descendants() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    fixture.drive.mkdir(ctx, "/old", 0o755).await.unwrap();
    let handle = fixture
        .drive
        .create(ctx, "/old/child.txt", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(handle, b"payload", 0).await.unwrap();

    fixture.drive.rename("/old", "/new", false).await.unwrap();

    let file = fixture.drive.table().get_open_file(handle).unwrap();
    assert_eq!(file.api_path().await, "/new/child.txt");
    assert_eq!(fixture.drive.read(handle, 7, 0).await.unwrap(), b"payload");
}

#[tokio::test]
async fn overwrite_rename_onto_an_open_target_keeps_the_new_data() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    fixture.seed("/old.txt", b"stale-contents").await;
    let stale = fixture.drive.open("/old.txt", OpenFlags::READ).await.unwrap();
    fixture.drive.read(stale, 64, 0).await.unwrap();

    let writer = fixture
        .drive
        .create(ctx, "/fresh.txt", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.write(writer, b"fresh-contents", 0).await.unwrap();
    fixture.drive.release(writer).await.unwrap();

    use cachalot::provider::Provider as _;
    let provider = std::sync::Arc::clone(&fixture.provider);
    fixture
        .wait_until("write-back of the fresh file", || {
            let provider = std::sync::Arc::clone(&provider);
            async move {
                let mut data = Vec::new();
                let stop = cachalot::types::StopToken::new();
                provider
                    .read_file_bytes("/fresh.txt", 64, 0, &mut data, &stop)
                    .await
                    .map(|_| data == b"fresh-contents")
                    .unwrap_or(false)
            }
        })
        .await;

    fixture.drive.rename("/fresh.txt", "/old.txt", true).await.unwrap();

    // the displaced target keeps serving its snapshot through the old handle
    let (stat, _) = fixture.drive.fgetattr(stale).await.unwrap();
    assert_eq!(stat.st_nlink, 0);
    assert_eq!(
        fixture.drive.read(stale, 64, 0).await.unwrap(),
        b"stale-contents"
    );

    // closing the stale handle must not delete the renamed-in file
    fixture.drive.release(stale).await.unwrap();
    assert!(fixture.provider.is_file("/old.txt").await.unwrap());

    let reopened = fixture.drive.open("/old.txt", OpenFlags::READ).await.unwrap();
    assert_eq!(
        fixture.drive.read(reopened, 64, 0).await.unwrap(),
        b"fresh-contents"
    );
}

#[tokio::test]
async fn unlink_while_open_serves_the_snapshot() {
    let fixture = Fixture::new().await;
    let data = pattern(256);
    fixture.seed("/doomed.txt", &data).await;

    let handle = fixture.drive.open("/doomed.txt", OpenFlags::READ).await.unwrap();
    fixture.drive.read(handle, data.len(), 0).await.unwrap();

    fixture.drive.unlink("/doomed.txt").await.unwrap();

    let (stat, directory) = fixture.drive.fgetattr(handle).await.unwrap();
    assert!(!directory);
    assert_eq!(stat.st_nlink, 0);
    assert_eq!(stat.st_size, data.len() as u64);

    // data stays readable until the last close
    assert_eq!(fixture.drive.read(handle, data.len(), 0).await.unwrap(), data);

    fixture.drive.release(handle).await.unwrap();
    use cachalot::provider::Provider as _;
    assert!(!fixture.provider.is_file("/doomed.txt").await.unwrap());
}

#[tokio::test]
async fn directory_lifecycle() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();

    fixture.drive.mkdir(ctx, "/tree", 0o755).await.unwrap();
    assert_eq!(
        fixture.drive.mkdir(ctx, "/tree", 0o755).await.unwrap_err(),
        ApiError::DirectoryExists
    );

    let handle = fixture
        .drive
        .create(ctx, "/tree/leaf.txt", OpenFlags::READ_WRITE, 0o644)
        .await
        .unwrap();
    fixture.drive.release(handle).await.unwrap();

    assert_eq!(fixture.drive.rmdir("/tree").await.unwrap_err(), ApiError::NotEmpty);
    fixture.drive.unlink("/tree/leaf.txt").await.unwrap();
    fixture.drive.rmdir("/tree").await.unwrap();
    assert_eq!(
        fixture.drive.rmdir("/tree").await.unwrap_err(),
        ApiError::DirectoryNotFound
    );
}

#[tokio::test]
async fn directory_listings_snapshot_at_opendir() {
    let fixture = Fixture::new().await;
    let ctx = Default::default();
    fixture.drive.mkdir(ctx, "/snap", 0o755).await.unwrap();
    fixture.seed("/snap/one.txt", b"1").await;

    let handle = fixture.drive.opendir("/snap", None).await.unwrap();

    // mutations after the snapshot stay invisible to this handle
    fixture.seed("/snap/two.txt", b"2").await;

    assert_eq!(fixture.drive.readdir(handle, 0).await.unwrap().api_path, ".");
    assert_eq!(fixture.drive.readdir(handle, 1).await.unwrap().api_path, "..");
    assert_eq!(
        fixture.drive.readdir(handle, 2).await.unwrap().api_path,
        "/snap/one.txt"
    );
    assert_eq!(
        fixture.drive.readdir(handle, 3).await.unwrap_err(),
        ApiError::ItemNotFound
    );

    fixture.drive.releasedir(handle).await.unwrap();
    assert_eq!(
        fixture.drive.readdir(handle, 0).await.unwrap_err(),
        ApiError::BadFileDescriptor
    );
}

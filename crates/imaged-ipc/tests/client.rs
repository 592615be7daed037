mod common;

use common::{client, TestHandler, TestLauncher, TEST_MASTER_KEY};
use imaged_core::ImagedError;
use imaged_crypto::ttl::{self, unix_now};
use imaged_crypto::{ExpiryStatus, MasterKey};

const DAY: i64 = 86_400;

fn write_container(dir: &std::path::Path, name: &str, expiry: i64, image: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    let container = ttl::encode(expiry, image, &MasterKey::from_bytes(TEST_MASTER_KEY)).unwrap();
    std::fs::write(&path, container).unwrap();
    path
}

#[tokio::test]
async fn test_convert_then_open() {
    let tmp = tempfile::TempDir::new().unwrap();
    let input = tmp.path().join("photo.png");
    std::fs::write(&input, b"\x89PNG fake image").unwrap();

    let client = client(TestLauncher::default());
    let output = client.convert_to_ttl(&input, unix_now() + 7 * DAY).await.unwrap();
    assert_eq!(output, tmp.path().join("photo.ttl"));

    let image = client.open_ttl(&output, false, None).await.unwrap();
    assert_eq!(image, b"\x89PNG fake image");
}

#[tokio::test]
async fn test_open_accepts_inline_base64() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_container(tmp.path(), "a.ttl", unix_now() + DAY * 2, b"pixels");

    let launcher = TestLauncher {
        handler: TestHandler {
            inline_open: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let image = client(launcher).open_ttl_thumbnail(&path, 256).await.unwrap();
    assert_eq!(image, b"pixels");
}

#[tokio::test]
async fn test_expired_container_never_reaches_worker() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_container(tmp.path(), "old.ttl", unix_now() - 1, b"pixels");

    let launcher = TestLauncher::default();
    let err = client(launcher.clone())
        .open_ttl(&path, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ImagedError::Expired(_)));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn test_open_rejects_foreign_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("plain.jpg");
    std::fs::write(&path, [0xFFu8, 0xD8, 0xFF, 0xE0]).unwrap();

    let err = client(TestLauncher::default())
        .open_ttl(&path, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ImagedError::Format(_)));
}

#[tokio::test]
async fn test_convert_validates_expiry_locally() {
    let tmp = tempfile::TempDir::new().unwrap();
    let input = tmp.path().join("photo.png");
    std::fs::write(&input, b"image").unwrap();

    let launcher = TestLauncher::default();
    let client = client(launcher.clone());

    let past = client.convert_to_ttl(&input, unix_now() - DAY).await;
    assert!(matches!(past, Err(ImagedError::InvalidRequest(_))));

    let too_far = client.convert_to_ttl(&input, unix_now() + 6 * 365 * DAY).await;
    assert!(matches!(too_far, Err(ImagedError::InvalidRequest(_))));

    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn test_worker_failure_surfaces_as_worker_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let client = client(TestLauncher::default());
    let err = client
        .convert_to_ttl(&tmp.path().join("missing.png"), unix_now() + DAY)
        .await
        .unwrap_err();
    assert!(matches!(err, ImagedError::Worker(_)));
}

#[tokio::test]
async fn test_expiry_status() {
    let tmp = tempfile::TempDir::new().unwrap();
    let soon = write_container(tmp.path(), "soon.ttl", unix_now() + 12 * 3600, b"x");
    let later = write_container(tmp.path(), "later.ttl", unix_now() + 30 * DAY, b"x");

    let client = client(TestLauncher::default());
    assert_eq!(client.expiry_status(&soon).await.unwrap().1, ExpiryStatus::NearExpiry);
    assert_eq!(client.expiry_status(&later).await.unwrap().1, ExpiryStatus::Active);
}

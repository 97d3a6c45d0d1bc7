use ytfetch::DownloadArchive;

#[tokio::test]
async fn archive_rerun_keeps_valid_ids_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("downloaded.txt");
    tokio::fs::write(&path, "jNQXAC9IVRw\nnot-a-video-id\n")
        .await
        .unwrap();

    let archive = DownloadArchive::load(&path).await.unwrap();
    assert!(archive.has("jNQXAC9IVRw"));
    assert!(!archive.has("not-a-video-id"));
    assert_eq!(archive.len(), 1);
}

#[tokio::test]
async fn add_is_idempotent_across_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("downloaded.txt");

    let archive = DownloadArchive::load(&path).await.unwrap();
    assert!(archive.add("jNQXAC9IVRw").await.unwrap());
    assert!(!archive.add("jNQXAC9IVRw").await.unwrap());
    assert!(!archive.add("definitely not an id").await.unwrap());

    let reloaded = DownloadArchive::load(&path).await.unwrap();
    assert!(reloaded.has("jNQXAC9IVRw"));
    assert_eq!(reloaded.len(), 1);

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert_eq!(contents, "jNQXAC9IVRw\n");
}

#[tokio::test]
async fn missing_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let archive = DownloadArchive::load(dir.path().join("absent.txt"))
        .await
        .unwrap();
    assert!(archive.is_empty());
}

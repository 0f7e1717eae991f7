// End-to-end scenarios for the upload core: create, resume, chunk
// delivery, assembly, dedup and cleanup, exercised at the service level.

mod support;

use depot::checksum::md5_hex;
use depot::Error;

use crate::support::{tracing_init, TestEnv, OTHER_USER, TEST_PROJECT, TEST_USER};

#[tokio::test]
async fn new_upload_in_two_chunks_lands_in_the_content_store() {
    tracing_init();
    let env = TestEnv::new().await;
    let ids = env.id_service();
    let uploads = env.upload_service();

    let created = ids
        .create(env.id_request("testreq.txt", 4, 2, "abc123"))
        .await
        .expect("create failed");
    assert_eq!(created.starting_block, 1);

    let status = uploads
        .upload(&env.chunk_request(&created.id, 1, 2, 4, 2, "testreq.txt", b"ab"))
        .await
        .expect("chunk 1 failed");
    assert!(!status.done);
    assert_eq!(status.file_id, "");

    // Resuming the same tuple reports the next block to send.
    let resumed = ids
        .create(env.id_request("testreq.txt", 4, 2, "abc123"))
        .await
        .expect("second create failed");
    assert_eq!(resumed.id, created.id);
    assert_eq!(resumed.starting_block, 2);

    let status = uploads
        .upload(&env.chunk_request(&created.id, 2, 2, 4, 2, "testreq.txt", b"cd"))
        .await
        .expect("chunk 2 failed");
    assert!(status.done);
    assert!(!status.file_id.is_empty());

    // The assembled file matches the concatenation of the chunks.
    let content = tokio::fs::read(env.paths.content_path(&status.file_id))
        .await
        .expect("content file missing");
    assert_eq!(content, b"abcd");

    let file = env
        .catalog
        .file_by_id(&status.file_id)
        .await
        .unwrap()
        .expect("catalog row missing");
    assert!(file.current);
    assert_eq!(file.size, 4);
    assert_eq!(file.checksum, md5_hex(b"abcd"));

    // All upload state is gone: request, tracker entry, staging blocks.
    let outstanding = ids.list(TEST_PROJECT, TEST_USER).await.unwrap();
    assert!(outstanding.is_empty());
    assert!(!env.tracker.exists(&created.id).await);
    assert!(!env.paths.staging_dir(&created.id).exists());
}

#[tokio::test]
async fn immediate_duplicate_creates_share_one_request() {
    tracing_init();
    let env = TestEnv::new().await;
    let ids = env.id_service();

    let first = ids
        .create(env.id_request("dup.txt", 4, 2, "abc123"))
        .await
        .unwrap();
    let second = ids
        .create(env.id_request("dup.txt", 4, 2, "abc123"))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.starting_block, 1);
    assert_eq!(second.starting_block, 1);
}

#[tokio::test]
async fn chunks_for_unknown_identifiers_are_invalid() {
    tracing_init();
    let env = TestEnv::new().await;

    let err = env
        .upload_service()
        .upload(&env.chunk_request("i-dont-exist", 1, 2, 4, 2, "x.txt", b"ab"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)), "got {:?}", err);
}

#[tokio::test]
async fn resending_an_arrived_chunk_changes_nothing() {
    tracing_init();
    let env = TestEnv::new().await;
    let ids = env.id_service();
    let uploads = env.upload_service();

    let created = ids
        .create(env.id_request("again.txt", 4, 2, "abc123"))
        .await
        .unwrap();
    uploads
        .upload(&env.chunk_request(&created.id, 1, 2, 4, 2, "again.txt", b"ab"))
        .await
        .unwrap();

    let block_path = env.paths.block_path(&created.id, 1);
    let before = tokio::fs::read(&block_path).await.unwrap();

    // Same chunk again: no error, no progress, same bytes on disk.
    let status = uploads
        .upload(&env.chunk_request(&created.id, 1, 2, 4, 2, "again.txt", b"ab"))
        .await
        .unwrap();
    assert!(!status.done);
    assert_eq!(tokio::fs::read(&block_path).await.unwrap(), before);

    let resumed = ids
        .create(env.id_request("again.txt", 4, 2, "abc123"))
        .await
        .unwrap();
    assert_eq!(resumed.starting_block, 2);

    let status = uploads
        .upload(&env.chunk_request(&created.id, 2, 2, 4, 2, "again.txt", b"cd"))
        .await
        .unwrap();
    assert!(status.done);
}

#[tokio::test]
async fn out_of_order_chunks_are_rejected() {
    tracing_init();
    let env = TestEnv::new().await;

    let created = env
        .id_service()
        .create(env.id_request("ooo.txt", 4, 2, "abc123"))
        .await
        .unwrap();

    let err = env
        .upload_service()
        .upload(&env.chunk_request(&created.id, 2, 2, 4, 2, "ooo.txt", b"cd"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)), "got {:?}", err);
}

#[tokio::test]
async fn chunks_with_the_wrong_length_are_rejected() {
    tracing_init();
    let env = TestEnv::new().await;

    let created = env
        .id_service()
        .create(env.id_request("short.txt", 4, 2, "abc123"))
        .await
        .unwrap();

    let err = env
        .upload_service()
        .upload(&env.chunk_request(&created.id, 1, 2, 4, 2, "short.txt", b"abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid(_)), "got {:?}", err);
}

#[tokio::test]
async fn duplicate_content_reuses_the_existing_file() {
    tracing_init();
    let env = TestEnv::new().await;
    let ids = env.id_service();
    let uploads = env.upload_service();
    let checksum = md5_hex(b"abcd");

    // First upload commits the content.
    let first = ids
        .create(env.id_request("same.txt", 4, 2, &checksum))
        .await
        .unwrap();
    uploads
        .upload(&env.chunk_request(&first.id, 1, 2, 4, 2, "same.txt", b"ab"))
        .await
        .unwrap();
    let status = uploads
        .upload(&env.chunk_request(&first.id, 2, 2, 4, 2, "same.txt", b"cd"))
        .await
        .unwrap();
    let original_file_id = status.file_id.clone();

    // Second upload of identical content into the same directory.
    let second = ids
        .create(env.id_request("same.txt", 4, 2, &checksum))
        .await
        .unwrap();
    assert_ne!(second.id, first.id);

    uploads
        .upload(&env.chunk_request(&second.id, 1, 2, 4, 2, "same.txt", b"ab"))
        .await
        .unwrap();
    let status = uploads
        .upload(&env.chunk_request(&second.id, 2, 2, 4, 2, "same.txt", b"cd"))
        .await
        .unwrap();

    // The existing file comes back and no second copy was committed.
    assert!(status.done);
    assert_eq!(status.file_id, original_file_id);
    assert!(env.paths.content_path(&original_file_id).exists());

    let outstanding = ids.list(TEST_PROJECT, TEST_USER).await.unwrap();
    assert!(outstanding.is_empty());
}

#[tokio::test]
async fn uploads_resume_after_tracker_loss() {
    tracing_init();
    let env = TestEnv::new().await;
    let ids = env.id_service();
    let uploads = env.upload_service();

    let created = ids
        .create(env.id_request("restart.txt", 4, 2, "abc123"))
        .await
        .unwrap();
    uploads
        .upload(&env.chunk_request(&created.id, 1, 2, 4, 2, "restart.txt", b"ab"))
        .await
        .unwrap();

    // Simulate a server restart: the in-memory tracker entry is gone but
    // the persistent request survives.
    env.tracker.clear(&created.id).await;

    let resumed = ids
        .create(env.id_request("restart.txt", 4, 2, "abc123"))
        .await
        .unwrap();
    assert_eq!(resumed.id, created.id);
    assert_eq!(resumed.starting_block, 2);

    let status = uploads
        .upload(&env.chunk_request(&created.id, 2, 2, 4, 2, "restart.txt", b"cd"))
        .await
        .unwrap();
    assert!(status.done);

    // The rolling hash died with the tracker, so the checksum must have
    // been recomputed from the assembled file.
    let file = env
        .catalog
        .file_by_id(&status.file_id)
        .await
        .unwrap()
        .expect("catalog row missing");
    assert_eq!(file.checksum, md5_hex(b"abcd"));
}

#[tokio::test]
async fn only_the_owner_or_project_owner_may_delete_a_request() {
    tracing_init();
    let env = TestEnv::new().await;
    let ids = env.id_service();

    let created = ids
        .create(env.id_request("del.txt", 4, 2, "abc123"))
        .await
        .unwrap();

    let err = ids.delete(&created.id, OTHER_USER).await.unwrap_err();
    assert!(matches!(err, Error::NoAccess), "got {:?}", err);

    ids.delete(&created.id, TEST_USER).await.unwrap();
    assert!(env
        .catalog
        .upload_by_id(&created.id)
        .await
        .unwrap()
        .is_none());

    let err = ids.delete(&created.id, TEST_USER).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {:?}", err);
}

#[tokio::test]
async fn listing_requires_project_access() {
    tracing_init();
    let env = TestEnv::new().await;
    let ids = env.id_service();

    let err = ids.list(TEST_PROJECT, OTHER_USER).await.unwrap_err();
    assert!(matches!(err, Error::NoAccess), "got {:?}", err);

    env.catalog
        .add_project_member(TEST_PROJECT, OTHER_USER)
        .await
        .unwrap();
    let outstanding = ids.list(TEST_PROJECT, OTHER_USER).await.unwrap();
    assert!(outstanding.is_empty());
}

#[tokio::test]
async fn directory_service_builds_missing_parents() {
    tracing_init();
    let env = TestEnv::new().await;
    let dirs = env.dir_service();

    let leaf = dirs.create(TEST_PROJECT, "test/data/runs").await.unwrap();
    assert_eq!(leaf.path, "test/data/runs");

    let parent = env
        .catalog
        .directory_by_path("test/data", TEST_PROJECT)
        .await
        .unwrap()
        .expect("parent was not created");
    assert_eq!(leaf.parent_id, parent.id);

    // Second create is a lookup, not a duplicate insert.
    let again = dirs.create(TEST_PROJECT, "test/data/runs").await.unwrap();
    assert_eq!(again.id, leaf.id);
}

#[tokio::test]
async fn directory_paths_outside_the_project_are_invalid() {
    tracing_init();
    let env = TestEnv::new().await;
    let dirs = env.dir_service();

    let err = dirs.create(TEST_PROJECT, "elsewhere/data").await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)), "got {:?}", err);

    let err = dirs.create("nope", "nope/data").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {:?}", err);
}

//! End-to-end transfer scenarios against a scripted transport.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_kit::mock::{MockResponse, MockService};
use bytes::Bytes;
use camino::Utf8Path;
use futures::TryStreamExt as _;
use http::StatusCode;
use sha1::{Digest as _, Sha1};
use tokio_util::sync::CancellationToken;

use b2_transfer::{
    ApplicationKey, BucketId, ErrorKind, FileId, MemorySink, Progress, Session, TransferConfig,
    TransferOptions,
};

const AUTHORIZE: &str = "/b2api/v2/b2_authorize_account";
const LIST_BUCKETS: &str = "/b2api/v2/b2_list_buckets";
const LIST_FILE_NAMES: &str = "/b2api/v2/b2_list_file_names";
const GET_UPLOAD_URL: &str = "/b2api/v2/b2_get_upload_url";
const GET_PART_URL: &str = "/b2api/v2/b2_get_upload_part_url";
const START_LARGE: &str = "/b2api/v2/b2_start_large_file";
const FINISH_LARGE: &str = "/b2api/v2/b2_finish_large_file";
const GET_FILE_INFO: &str = "/b2api/v2/b2_get_file_info";
const DELETE_FILE_VERSION: &str = "/b2api/v2/b2_delete_file_version";
const DOWNLOAD_BY_ID: &str = "/b2api/v2/b2_download_file_by_id";
const UPLOAD: &str = "/pod/upload";
const PART: &str = "/pod/part";

fn sha_hex(content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

fn authorize_fixture() -> serde_json::Value {
    serde_json::json!({
        "accountId": "acct-1",
        "authorizationToken": "token-1",
        "apiUrl": "https://api000.backblazeb2.test",
        "downloadUrl": "https://f000.backblazeb2.test",
        "recommendedPartSize": 4096,
        "absoluteMinimumPartSize": 1024,
        "allowed": {"capabilities": ["readFiles", "writeFiles"]},
    })
}

fn file_info_fixture(
    file_id: &str,
    name: &str,
    action: &str,
    length: u64,
    sha1: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "accountId": "acct-1",
        "action": action,
        "bucketId": "bucket-1",
        "contentLength": length,
        "contentSha1": sha1,
        "contentType": "b2/x-auto",
        "fileId": file_id,
        "fileName": name,
        "fileInfo": {},
        "uploadTimestamp": 1_700_000_000_000u64,
    })
}

fn upload_url_fixture(path: &str, token: &str) -> serde_json::Value {
    serde_json::json!({
        "uploadUrl": format!("https://pod.backblazeb2.test{path}"),
        "authorizationToken": token,
    })
}

fn error_fixture(status: u16, code: &str) -> serde_json::Value {
    serde_json::json!({
        "status": status,
        "code": code,
        "message": "scripted failure",
    })
}

async fn connected(mock: &MockService, config: TransferConfig) -> Session {
    mock.add(AUTHORIZE, MockResponse::json(StatusCode::OK, &authorize_fixture()));

    let session = Session::with_service(
        mock.clone(),
        ApplicationKey::new("001-test-key-id", "K001-test-key"),
        config,
    );
    session.connect().await.expect("connect");
    session
}

fn deterministic_bytes(len: usize) -> Bytes {
    Bytes::from((0..len).map(|n| (n % 251) as u8).collect::<Vec<u8>>())
}

#[tokio::test]
async fn small_upload_round_trip() {
    let mock = MockService::new();
    let session = connected(&mock, TransferConfig::default()).await;

    let content = deterministic_bytes(2048);
    let sha = sha_hex(&content);

    mock.add(
        GET_UPLOAD_URL,
        MockResponse::json(StatusCode::OK, &upload_url_fixture(UPLOAD, "upload-token")),
    );
    mock.add(
        UPLOAD,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-1", "hello.txt", "upload", 2048, sha.clone().into()),
        ),
    );

    let events: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let options = TransferOptions::new()
        .with_progress(Arc::new(move |progress| sink.lock().unwrap().push(progress)));

    let uploaded = session
        .upload(
            &BucketId::new("bucket-1"),
            Utf8Path::new("hello.txt"),
            None,
            BTreeMap::new(),
            &content,
            &options,
        )
        .await
        .expect("upload");

    assert_eq!(uploaded.content_sha1(), Some(sha.as_str()));
    assert_eq!(mock.hits(GET_UPLOAD_URL), 1);
    assert_eq!(mock.hits(UPLOAD), 1);

    // The upload carried the declared name, length, and digest.
    let recorded = mock.requests(UPLOAD);
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded[0].headers.get("x-bz-content-sha1").unwrap(),
        sha.as_str()
    );
    assert_eq!(recorded[0].body.as_ref(), content.as_ref());

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].bytes_transferred, 2048);
    assert_eq!(events[0].total_bytes, 2048);
}

#[tokio::test]
async fn large_upload_splits_into_ordered_parts() {
    let mock = MockService::new();
    let session = connected(
        &mock,
        TransferConfig {
            upload_part_size: 5 * 1024,
            ..Default::default()
        },
    )
    .await;

    let content = deterministic_bytes(12 * 1024);
    let part_shas = [
        sha_hex(&content[..5 * 1024]),
        sha_hex(&content[5 * 1024..10 * 1024]),
        sha_hex(&content[10 * 1024..]),
    ];

    mock.add(
        START_LARGE,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-large", "big.bin", "start", 0, "none".into()),
        ),
    );
    mock.add(
        GET_PART_URL,
        MockResponse::json(StatusCode::OK, &upload_url_fixture(PART, "part-token")),
    );
    mock.add(
        PART,
        MockResponse::json(
            StatusCode::OK,
            &serde_json::json!({"partNumber": 1, "contentSha1": "ignored"}),
        ),
    );
    mock.add(
        FINISH_LARGE,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-large", "big.bin", "upload", 12 * 1024, "none".into()),
        ),
    );

    let uploaded = session
        .upload(
            &BucketId::new("bucket-1"),
            Utf8Path::new("big.bin"),
            None,
            BTreeMap::new(),
            &content,
            &TransferOptions::new(),
        )
        .await
        .expect("large upload");

    assert_eq!(uploaded.id(), &FileId::from("f-large"));
    assert_eq!(mock.hits(START_LARGE), 1);
    assert_eq!(mock.hits(PART), 3);
    assert_eq!(mock.hits(FINISH_LARGE), 1);

    // Part numbers 1..=3 with sizes 5 KiB, 5 KiB, 2 KiB.
    let parts = mock.requests(PART);
    for (index, recorded) in parts.iter().enumerate() {
        assert_eq!(
            recorded.headers.get("x-bz-part-number").unwrap(),
            &(index + 1).to_string()
        );
        assert_eq!(
            recorded.headers.get("x-bz-content-sha1").unwrap(),
            part_shas[index].as_str()
        );
    }
    assert_eq!(parts[0].body.len(), 5 * 1024);
    assert_eq!(parts[2].body.len(), 2 * 1024);

    // The start call declared the whole-file digest.
    let start_body: serde_json::Value =
        serde_json::from_slice(&mock.requests(START_LARGE)[0].body).unwrap();
    assert_eq!(
        start_body["fileInfo"]["large_file_sha1"],
        serde_json::Value::from(sha_hex(&content))
    );

    // The finish call listed the part digests in part-number order.
    let finish_body: serde_json::Value =
        serde_json::from_slice(&mock.requests(FINISH_LARGE)[0].body).unwrap();
    assert_eq!(
        finish_body["partSha1Array"],
        serde_json::json!([part_shas[0], part_shas[1], part_shas[2]])
    );
}

#[tokio::test]
async fn expired_token_triggers_exactly_one_reauthorize() {
    let mock = MockService::new();
    let session = connected(
        &mock,
        TransferConfig {
            upload_part_size: 5 * 1024,
            ..Default::default()
        },
    )
    .await;

    let content = deterministic_bytes(12 * 1024);

    mock.add(
        START_LARGE,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-large", "big.bin", "start", 0, "none".into()),
        ),
    );
    mock.add(
        GET_PART_URL,
        MockResponse::json(StatusCode::OK, &upload_url_fixture(PART, "part-token")),
    );
    // The first part upload is rejected with an expired token, then the
    // retried attempt and the remaining parts succeed.
    mock.add(
        PART,
        MockResponse::json(
            StatusCode::UNAUTHORIZED,
            &error_fixture(401, "expired_auth_token"),
        ),
    );
    mock.add(
        PART,
        MockResponse::json(
            StatusCode::OK,
            &serde_json::json!({"partNumber": 1, "contentSha1": "ignored"}),
        ),
    );
    mock.add(
        FINISH_LARGE,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-large", "big.bin", "upload", 12 * 1024, "none".into()),
        ),
    );

    session
        .upload(
            &BucketId::new("bucket-1"),
            Utf8Path::new("big.bin"),
            None,
            BTreeMap::new(),
            &content,
            &TransferOptions::new(),
        )
        .await
        .expect("upload with token refresh");

    // One authorize for connect, exactly one more for the refresh.
    assert_eq!(mock.hits(AUTHORIZE), 2);
    assert_eq!(mock.hits(PART), 4);
    assert_eq!(mock.hits(FINISH_LARGE), 1);
}

#[tokio::test]
async fn download_hash_mismatch_retries_and_recovers() {
    let mock = MockService::new();
    let session = connected(&mock, TransferConfig::default()).await;

    let content = deterministic_bytes(1024);
    let sha = sha_hex(&content);
    let mut corrupted = content.to_vec();
    corrupted[100] ^= 0xff;

    let path = "/file/bucket-1/hello.txt";
    let sha_header = http::HeaderValue::from_str(&sha).unwrap();

    // HEAD probe, then a corrupted body, then the real one.
    mock.add(
        path,
        MockResponse::new(StatusCode::OK)
            .header(http::header::CONTENT_LENGTH, http::HeaderValue::from(1024))
            .header(
                http::HeaderName::from_static("x-bz-content-sha1"),
                sha_header.clone(),
            ),
    );
    mock.add(
        path,
        MockResponse::new(StatusCode::OK)
            .header(
                http::HeaderName::from_static("x-bz-content-sha1"),
                sha_header.clone(),
            )
            .body(corrupted),
    );
    mock.add(
        path,
        MockResponse::new(StatusCode::OK)
            .header(http::HeaderName::from_static("x-bz-content-sha1"), sha_header)
            .body(content.to_vec()),
    );

    let sink = MemorySink::new();
    let length = session
        .download_by_name(
            "bucket-1",
            Utf8Path::new("hello.txt"),
            &sink,
            &TransferOptions::new(),
        )
        .await
        .expect("download with one digest retry");

    assert_eq!(length, 1024);
    assert_eq!(mock.hits(path), 3);
    assert_eq!(sink.to_bytes().as_ref(), content.as_ref());
    assert_eq!(sha_hex(&sink.to_bytes()), sha);
}

#[tokio::test]
async fn cancellation_stops_an_upload_before_any_transfer() {
    let mock = MockService::new();
    let session = connected(
        &mock,
        TransferConfig {
            upload_part_size: 10 * 1024,
            ..Default::default()
        },
    )
    .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = TransferOptions::new().with_cancel(cancel);

    let content = deterministic_bytes(100 * 1024);
    let error = session
        .upload(
            &BucketId::new("bucket-1"),
            Utf8Path::new("big.bin"),
            None,
            BTreeMap::new(),
            &content,
            &options,
        )
        .await
        .expect_err("cancelled upload");

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    // Only the connect call went out; no large-file session was opened.
    assert_eq!(mock.hits(AUTHORIZE), 1);
    assert_eq!(mock.hits(START_LARGE), 0);
}

#[tokio::test]
async fn bulkhead_caps_concurrent_uploads() {
    let mock = MockService::new();
    let session = connected(
        &mock,
        TransferConfig {
            upload_connections: 2,
            ..Default::default()
        },
    )
    .await;

    mock.add(
        GET_UPLOAD_URL,
        MockResponse::json(StatusCode::OK, &upload_url_fixture(UPLOAD, "upload-token")),
    );
    mock.add(
        UPLOAD,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-1", "hello.txt", "upload", 512, serde_json::Value::Null),
        )
        .delay(Duration::from_millis(25)),
    );

    let mut tasks = Vec::new();
    for n in 0..8 {
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let content = deterministic_bytes(512);
            session
                .upload(
                    &BucketId::new("bucket-1"),
                    Utf8Path::new(&format!("file-{n}.bin")),
                    None,
                    BTreeMap::new(),
                    &content,
                    &TransferOptions::new(),
                )
                .await
        }));
    }

    for task in tasks {
        task.await.expect("join").expect("upload");
    }

    assert_eq!(mock.hits(UPLOAD), 8);
    assert!(mock.peak(UPLOAD) <= 2, "peak {} > 2", mock.peak(UPLOAD));
}

#[tokio::test]
async fn upload_url_errors_evict_the_cached_lease() {
    let mock = MockService::new();
    let session = connected(&mock, TransferConfig::default()).await;

    let content = deterministic_bytes(512);

    mock.add(
        GET_UPLOAD_URL,
        MockResponse::json(StatusCode::OK, &upload_url_fixture(UPLOAD, "upload-token")),
    );
    mock.add(
        UPLOAD,
        MockResponse::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &error_fixture(503, "service_unavailable"),
        ),
    );
    mock.add(
        UPLOAD,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-1", "hello.txt", "upload", 512, serde_json::Value::Null),
        ),
    );

    // Transient faults are not retried by the engine; the first upload
    // surfaces the 503 and discards its lease.
    let error = session
        .upload(
            &BucketId::new("bucket-1"),
            Utf8Path::new("hello.txt"),
            None,
            BTreeMap::new(),
            &content,
            &TransferOptions::new(),
        )
        .await
        .expect_err("scripted 503");
    assert_eq!(error.kind(), ErrorKind::Transient);

    session
        .upload(
            &BucketId::new("bucket-1"),
            Utf8Path::new("hello.txt"),
            None,
            BTreeMap::new(),
            &content,
            &TransferOptions::new(),
        )
        .await
        .expect("second upload");

    // The poisoned lease was not reused: a fresh URL was fetched.
    assert_eq!(mock.hits(GET_UPLOAD_URL), 2);
}

#[tokio::test]
async fn ranged_download_by_id_reassembles_the_content() {
    let mock = MockService::new();
    let session = connected(
        &mock,
        TransferConfig {
            download_part_size: 5 * 1024,
            ..Default::default()
        },
    )
    .await;

    let content = deterministic_bytes(12 * 1024);

    mock.add(
        GET_FILE_INFO,
        MockResponse::json(
            StatusCode::OK,
            &file_info_fixture("f-big", "big.bin", "upload", 12 * 1024, "none".into()),
        ),
    );
    // One response per planned range, in part order (connections = 1).
    mock.add(
        DOWNLOAD_BY_ID,
        MockResponse::new(StatusCode::PARTIAL_CONTENT).body(content[..5 * 1024].to_vec()),
    );
    mock.add(
        DOWNLOAD_BY_ID,
        MockResponse::new(StatusCode::PARTIAL_CONTENT).body(content[5 * 1024..10 * 1024].to_vec()),
    );
    mock.add(
        DOWNLOAD_BY_ID,
        MockResponse::new(StatusCode::PARTIAL_CONTENT).body(content[10 * 1024..].to_vec()),
    );

    let sink = MemorySink::new();
    let length = session
        .download_by_id(&FileId::from("f-big"), &sink, &TransferOptions::new())
        .await
        .expect("ranged download");

    assert_eq!(length, 12 * 1024);
    assert_eq!(mock.hits(GET_FILE_INFO), 1);
    assert_eq!(mock.hits(DOWNLOAD_BY_ID), 3);
    assert_eq!(sink.to_bytes().as_ref(), content.as_ref());

    let ranges: Vec<String> = mock
        .requests(DOWNLOAD_BY_ID)
        .iter()
        .map(|r| r.headers.get(http::header::RANGE).unwrap().to_str().unwrap().to_owned())
        .collect();
    assert_eq!(ranges, ["bytes=0-5119", "bytes=5120-10239", "bytes=10240-12287"]);
}

#[tokio::test]
async fn file_name_listing_follows_continuation_tokens() {
    let mock = MockService::new();
    let session = connected(&mock, TransferConfig::default()).await;

    mock.add(
        LIST_FILE_NAMES,
        MockResponse::json(
            StatusCode::OK,
            &serde_json::json!({
                "files": [
                    file_info_fixture("f-1", "a.txt", "upload", 1, serde_json::Value::Null),
                    file_info_fixture("f-2", "b.txt", "upload", 1, serde_json::Value::Null),
                ],
                "nextFileName": "c.txt",
            }),
        ),
    );
    mock.add(
        LIST_FILE_NAMES,
        MockResponse::json(
            StatusCode::OK,
            &serde_json::json!({
                "files": [
                    file_info_fixture("f-3", "c.txt", "upload", 1, serde_json::Value::Null),
                ],
                "nextFileName": serde_json::Value::Null,
            }),
        ),
    );

    let bucket = BucketId::new("bucket-1");
    let files: Vec<_> = session
        .list_file_names(&bucket, None)
        .try_collect()
        .await
        .expect("listing");

    assert_eq!(mock.hits(LIST_FILE_NAMES), 2);
    let names: Vec<_> = files.iter().map(|f| f.path().as_str()).collect();
    assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);

    // The second request carried the continuation token.
    let second: serde_json::Value =
        serde_json::from_slice(&mock.requests(LIST_FILE_NAMES)[1].body).unwrap();
    assert_eq!(second["startFileName"], "c.txt");
}

#[tokio::test]
async fn delete_file_sweeps_exact_matches_across_pages() {
    let mock = MockService::new();
    let session = connected(&mock, TransferConfig::default()).await;

    // The prefix listing spans two pages; the exact match sits on the
    // second, behind a name that merely extends the target.
    mock.add(
        LIST_FILE_NAMES,
        MockResponse::json(
            StatusCode::OK,
            &serde_json::json!({
                "files": [
                    file_info_fixture("f-1", "docs/a.txt.bak", "upload", 1, serde_json::Value::Null),
                ],
                "nextFileName": "docs/a.txt.bak",
            }),
        ),
    );
    mock.add(
        LIST_FILE_NAMES,
        MockResponse::json(
            StatusCode::OK,
            &serde_json::json!({
                "files": [
                    file_info_fixture("f-2", "docs/a.txt", "upload", 1, serde_json::Value::Null),
                ],
                "nextFileName": serde_json::Value::Null,
            }),
        ),
    );
    mock.add(
        DELETE_FILE_VERSION,
        MockResponse::json(
            StatusCode::OK,
            &serde_json::json!({"fileId": "f-2", "fileName": "docs/a.txt"}),
        ),
    );

    session
        .delete_file(&BucketId::new("bucket-1"), Utf8Path::new("docs/a.txt"))
        .await
        .expect("delete file");

    // The listing was driven by the file name as prefix, and followed the
    // continuation token.
    assert_eq!(mock.hits(LIST_FILE_NAMES), 2);
    let listed: serde_json::Value =
        serde_json::from_slice(&mock.requests(LIST_FILE_NAMES)[0].body).unwrap();
    assert_eq!(listed["prefix"], "docs/a.txt");

    // Only the exact match was deleted.
    assert_eq!(mock.hits(DELETE_FILE_VERSION), 1);
    let deleted: serde_json::Value =
        serde_json::from_slice(&mock.requests(DELETE_FILE_VERSION)[0].body).unwrap();
    assert_eq!(deleted["fileId"], "f-2");
    assert_eq!(deleted["fileName"], "docs/a.txt");
}

#[tokio::test]
async fn test_mode_is_forwarded_on_api_calls() {
    let mock = MockService::new();
    let session = connected(
        &mock,
        TransferConfig {
            test_mode: Some(b2_transfer::TestMode::ForceCapExceeded),
            ..Default::default()
        },
    )
    .await;

    mock.add(
        LIST_BUCKETS,
        MockResponse::json(StatusCode::OK, &serde_json::json!({"buckets": []})),
    );

    session.list_buckets((), None).await.expect("list buckets");

    let recorded = mock.requests(LIST_BUCKETS);
    assert_eq!(
        recorded[0].headers.get("x-bz-test-mode").unwrap(),
        "force_cap_exceeded"
    );
}

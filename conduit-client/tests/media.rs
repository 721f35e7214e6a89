//! Upload and download pipeline behavior: part counts, headers, cancellation,
//! ranged windows and the skip-on-failure contract.

mod common;

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use conduit_client::{Client, DownloadError, TransportError, UploadError, UploadSource};
use serde_json::json;

const UPLOAD_URL:  &str = "http://up.test/";
const STORAGE_URL: &str = "http://st505.test/GetFile";

fn descriptor_reply() -> serde_json::Value {
    json!({
        "status": "OK",
        "data": {
            "id":               "F1",
            "dc_id":            "505",
            "upload_url":       UPLOAD_URL,
            "access_hash_send": "AHS",
        }
    })
}

fn part_reply() -> serde_json::Value {
    json!({
        "status":     "OK",
        "status_det": "OK",
        "data":       { "access_hash_rec": "AHR" },
    })
}

/// Routes bootstrap, RPC and upload-endpoint traffic for the happy path.
fn upload_http() -> Arc<FakeHttp> {
    FakeHttp::new(|req| {
        if req.url.starts_with(BOOT_URL) {
            ok_json(&directory_json())
        } else if req.url.starts_with(API_URL) {
            ok_json(&descriptor_reply())
        } else {
            ok_json(&part_reply())
        }
    })
}

fn client(http: Arc<FakeHttp>) -> Client {
    Client::new(test_config(http), Arc::new(CountingCrypto::default())).unwrap()
}

#[tokio::test]
async fn upload_posts_one_extra_part_and_numbers_them_from_one() {
    let http = upload_http();
    let c = client(http.clone());

    // 10 bytes at chunk size 4: 10/4 + 1 = 3 parts of 4, 4 and 2 bytes.
    let result = c
        .upload_file(vec![7u8; 10], Some("application/x-test"), Some("blob.bin"), 4, None)
        .await
        .unwrap()
        .unwrap();

    let parts = http.requests_to(UPLOAD_URL);
    assert_eq!(parts.len(), 3);
    for (i, part) in parts.iter().enumerate() {
        assert_eq!(part.header("part-number").unwrap(), (i + 1).to_string());
        assert_eq!(part.header("total-part").unwrap(), "3");
        assert_eq!(part.header("file-id").unwrap(), "F1");
        assert_eq!(part.header("access-hash-send").unwrap(), "AHS");
        assert_eq!(part.header("auth").unwrap(), "TOKEN");
    }
    assert_eq!(parts[0].body.len(), 4);
    assert_eq!(parts[2].body.len(), 2);

    assert_eq!(result.file_id, "F1");
    assert_eq!(result.dc_id, "505");
    assert_eq!(result.size, 10);
    assert_eq!(result.file_name, "blob.bin");
    assert_eq!(result.access_hash_rec, "AHR");
}

#[tokio::test]
async fn exact_multiple_sends_a_trailing_empty_part() {
    let http = upload_http();
    let c = client(http.clone());

    c.upload_file(vec![1u8; 8], Some("application/x-test"), Some("b.bin"), 4, None)
        .await
        .unwrap()
        .unwrap();

    let parts = http.requests_to(UPLOAD_URL);
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[2].header("chunk-size").unwrap(), "0");
    assert!(parts[2].body.is_empty());
}

#[tokio::test]
async fn cancellation_from_the_progress_callback_stops_the_pipeline() {
    let http = upload_http();
    let c = client(http.clone());

    let result = c
        .upload_file(
            vec![1u8; 10],
            Some("application/x-test"),
            Some("b.bin"),
            4,
            Some(Arc::new(|_total, _sent| ControlFlow::Break(()))),
        )
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(http.requests_to(UPLOAD_URL).len(), 1);
}

#[tokio::test]
async fn progress_reports_monotonically_increasing_byte_counts() {
    let http = upload_http();
    let c = client(http);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    c.upload_file(
        vec![1u8; 10],
        Some("application/x-test"),
        Some("b.bin"),
        4,
        Some(Arc::new(move |total, sent| {
            seen2.lock().unwrap().push((total, sent));
            ControlFlow::Continue(())
        })),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(seen.lock().unwrap().as_slice(), [(10, 4), (10, 8), (10, 10)]);
}

#[tokio::test]
async fn server_rejection_surfaces_the_detail() {
    let http = FakeHttp::new(|req| {
        if req.url.starts_with(BOOT_URL) {
            ok_json(&directory_json())
        } else if req.url.starts_with(API_URL) {
            ok_json(&descriptor_reply())
        } else {
            ok_json(&json!({"status": "ERROR_GENERIC", "status_det": "INVALID_AUTH"}))
        }
    });
    let c = client(http);

    match c
        .upload_file(vec![1u8; 4], None, Some("b.bin"), 4, None)
        .await
        .unwrap_err()
    {
        UploadError::Rejected { status, detail } => {
            assert_eq!(status, "ERROR_GENERIC");
            assert_eq!(detail.as_deref(), Some("INVALID_AUTH"));
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn persistently_failing_part_gives_up_after_its_budget() {
    let http = FakeHttp::new(|req| {
        if req.url.starts_with(BOOT_URL) {
            ok_json(&directory_json())
        } else if req.url.starts_with(API_URL) {
            ok_json(&descriptor_reply())
        } else {
            Err(TransportError::Timeout)
        }
    });
    let c = client(http.clone());

    match c
        .upload_file(vec![1u8; 4], None, Some("b.bin"), 4, None)
        .await
        .unwrap_err()
    {
        UploadError::GaveUp { part, attempts } => {
            assert_eq!(part, 1);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected GaveUp, got {other:?}"),
    }
    // The same part index was retried — never part 2.
    let parts = http.requests_to(UPLOAD_URL);
    assert_eq!(parts.len(), 3);
    assert!(parts.iter().all(|p| p.header("part-number").unwrap() == "1"));
}

#[tokio::test]
async fn bytes_without_a_name_fail_fast() {
    let c = client(upload_http());
    match c.upload_file(vec![1u8; 4], None, None, 4, None).await.unwrap_err() {
        UploadError::MissingName => {}
        other => panic!("expected MissingName, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_path_fails_fast() {
    let c = client(upload_http());
    let source = UploadSource::Path("/definitely/not/here.bin".into());
    match c.upload_file(source, None, None, 4, None).await.unwrap_err() {
        UploadError::InvalidInput(_) => {}
        other => panic!("expected InvalidInput, got {other:?}"),
    }
}

// ─── Download ─────────────────────────────────────────────────────────────────

fn range_len(req: &Recorded) -> usize {
    let start: u64 = req.header("start-index").unwrap().parse().unwrap();
    let last: u64 = req.header("last-index").unwrap().parse().unwrap();
    (last - start + 1) as usize
}

fn download_client(http: Arc<FakeHttp>) -> Client {
    let mut config = test_config(http);
    config.storage_map.insert("505", STORAGE_URL);
    Client::new(config, Arc::new(CountingCrypto::default())).unwrap()
}

#[tokio::test]
async fn download_issues_clamped_ranged_requests() {
    let http = FakeHttp::new(|req| ok_bytes(vec![0u8; range_len(req)]));
    let c = download_client(http.clone());

    let bytes = c
        .download_file("505", "F1", "AHR", 1_000_000, 131_072, None)
        .await
        .unwrap();

    assert_eq!(bytes.len(), 1_000_000);
    let requests = http.requests_to(STORAGE_URL);
    assert_eq!(requests.len(), 8);
    assert_eq!(requests[0].header("start-index").unwrap(), "0");
    assert_eq!(requests[0].header("last-index").unwrap(), "131071");
    assert_eq!(requests[7].header("last-index").unwrap(), "999999");
    for req in &requests {
        assert_eq!(req.header("auth").unwrap(), "TOKEN");
        assert_eq!(req.header("access-hash-rec").unwrap(), "AHR");
        assert_eq!(req.header("file-id").unwrap(), "F1");
        assert!(req.header("user-agent").is_some());
    }
}

#[tokio::test]
async fn failed_range_is_skipped_and_shortens_the_result() {
    let http = FakeHttp::new(|req| {
        if req.header("start-index").unwrap() == "262144" {
            status(500)
        } else {
            ok_bytes(vec![0u8; range_len(req)])
        }
    });
    let c = download_client(http.clone());

    let bytes = c
        .download_file("505", "F1", "AHR", 1_000_000, 131_072, None)
        .await
        .unwrap();

    // The window still advanced past the failed range, so every range was
    // requested exactly once and the result is short by one chunk.
    assert_eq!(http.requests_to(STORAGE_URL).len(), 8);
    assert_eq!(bytes.len(), 1_000_000 - 131_072);
}

#[tokio::test]
async fn download_reports_progress_per_range() {
    let http = FakeHttp::new(|req| ok_bytes(vec![0u8; range_len(req)]));
    let c = download_client(http);

    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = seen.clone();
    let bytes = c
        .download_file(
            "505",
            "F1",
            "AHR",
            300_000,
            131_072,
            Some(Arc::new(move |_total, received| {
                seen2.store(received as usize, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();

    assert_eq!(bytes.len(), 300_000);
    assert_eq!(seen.load(Ordering::SeqCst), 300_000);
}

#[tokio::test]
async fn unknown_datacenter_fails_before_any_request() {
    let http = FakeHttp::new(|_| status(500));
    let c = download_client(http.clone());

    match c
        .download_file("999", "F1", "AHR", 1024, 512, None)
        .await
        .unwrap_err()
    {
        DownloadError::UnknownDatacenter(dc) => assert_eq!(dc, "999"),
        other => panic!("expected UnknownDatacenter, got {other:?}"),
    }
    assert!(http.requests().is_empty());
}

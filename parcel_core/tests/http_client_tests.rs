use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use parcel_core::client::HttpClient;
use parcel_core::interval::IntervalSet;
use parcel_core::state;

/// Generates deterministic test data: each byte = (offset % 251) as u8.
fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// A wiremock responder that serves an object the way the data server does:
/// plain GETs get the full body plus metadata headers, Range GETs get the
/// sliced body with 206.
struct RangeResponder {
    body: Vec<u8>,
    file_name: Option<&'static str>,
}

impl wiremock::Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if let Some(range_header) = request.headers.get(&reqwest::header::RANGE) {
            let range_str = range_header.to_str().unwrap_or("");
            if let Some((start, end)) = parse_range(range_str, self.body.len()) {
                return ResponseTemplate::new(206)
                    .set_body_bytes(self.body[start..=end].to_vec())
                    .insert_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", start, end, self.body.len()),
                    );
            }
        }
        let mut template = ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        if let Some(name) = self.file_name {
            template = template.insert_header(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", name),
            );
        }
        template
    }
}

/// Parses a Range header like "bytes=1024-2047".
fn parse_range(header: &str, body_len: usize) -> Option<(usize, usize)> {
    let s = header.strip_prefix("bytes=")?;
    let (start, end) = s.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = if end.is_empty() {
        body_len - 1
    } else {
        end.parse().ok()?
    };
    Some((start, end.min(body_len - 1)))
}

async fn range_requests(server: &MockServer) -> Vec<(u64, u64)> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|request| {
            let header = request.headers.get(&reqwest::header::RANGE)?;
            let (start, end) = parse_range(header.to_str().ok()?, usize::MAX)?;
            Some((start as u64, end as u64))
        })
        .collect()
}

fn make_client(server: &MockServer, dir: &tempfile::TempDir) -> HttpClient {
    HttpClient::builder(server.uri(), "secret-token")
        .with_worker_count(4)
        .with_directory(dir.path())
        .with_http_chunk_size(65536)
        .with_small_file_threshold(0)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------
// plain batch download
// ---------------------------------------------------------------

#[tokio::test]
async fn test_plain_download_end_to_end() {
    let body = generate_test_data(1_048_576);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/abc"))
        .respond_with(RangeResponder {
            body: body.clone(),
            file_name: Some("data.bin"),
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = make_client(&server, &dir);
    let report = client.download(vec!["abc".to_string()]).await;

    assert_eq!(
        report.downloaded.iter().cloned().collect::<Vec<_>>(),
        vec!["abc".to_string()]
    );
    assert!(report.errors.is_empty());

    let output = std::fs::read(dir.path().join("abc_data.bin")).unwrap();
    assert_eq!(output.len(), body.len());
    assert_eq!(output, body, "downloaded file should match byte-for-byte");

    // four workers each took one quarter
    let mut ranges = range_requests(&server).await;
    ranges.sort_unstable();
    assert_eq!(
        ranges,
        vec![
            (0, 262_143),
            (262_144, 524_287),
            (524_288, 786_431),
            (786_432, 1_048_575),
        ]
    );

    // the completed set on disk covers the whole file
    let loaded = state::load(&dir.path().join(".abc_data.bin.parcel")).unwrap();
    assert_eq!(loaded.measure(), body.len() as u64);
}

#[tokio::test]
async fn test_duplicate_ids_download_once() {
    let body = generate_test_data(16_384);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/abc"))
        .respond_with(RangeResponder {
            body,
            file_name: None,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = make_client(&server, &dir);
    let report = client
        .download(vec!["abc".to_string(), "abc".to_string()])
        .await;

    assert_eq!(report.downloaded.len(), 1);
    // one metadata probe, not two
    let metadata_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.headers.get(&reqwest::header::RANGE).is_none())
        .count();
    assert_eq!(metadata_requests, 1);
}

#[tokio::test]
async fn test_small_file_uses_a_single_worker() {
    let body = generate_test_data(8192);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tiny"))
        .respond_with(RangeResponder {
            body: body.clone(),
            file_name: None,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = HttpClient::builder(server.uri(), "secret-token")
        .with_worker_count(4)
        .with_directory(dir.path())
        // 8 KiB is below the default small-file threshold
        .build()
        .unwrap();
    let report = client.download(vec!["tiny".to_string()]).await;
    assert!(report.errors.is_empty());

    let ranges = range_requests(&server).await;
    assert_eq!(ranges, vec![(0, 8191)], "one worker, one whole-file range");

    let output = std::fs::read(dir.path().join("tiny")).unwrap();
    assert_eq!(output, body);
}

#[tokio::test]
async fn test_empty_file_short_circuits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::new()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = make_client(&server, &dir);
    let report = client.download(vec!["empty".to_string()]).await;

    assert!(report.errors.is_empty());
    let meta = std::fs::metadata(dir.path().join("empty")).unwrap();
    assert_eq!(meta.len(), 0);
    // metadata only; no range was ever requested
    assert!(range_requests(&server).await.is_empty());
}

// ---------------------------------------------------------------
// resume
// ---------------------------------------------------------------

#[tokio::test]
async fn test_resume_fetches_only_the_remainder() {
    let body = generate_test_data(1_048_576);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/abc"))
        .respond_with(RangeResponder {
            body: body.clone(),
            file_name: Some("data.bin"),
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();

    // a previous run wrote the first quarter and saved its state
    let mut partial = body.clone();
    for byte in &mut partial[262_144..] {
        *byte = 0;
    }
    std::fs::write(dir.path().join("abc_data.bin"), &partial).unwrap();
    let mut completed = IntervalSet::new();
    completed.insert(parcel_core::interval::Interval::new(0, 262_144));
    state::save(&dir.path().join(".abc_data.bin.parcel"), &completed).unwrap();

    let client = make_client(&server, &dir);
    let report = client.download(vec!["abc".to_string()]).await;
    assert!(report.errors.is_empty());

    let output = std::fs::read(dir.path().join("abc_data.bin")).unwrap();
    assert_eq!(output, body);

    let ranges = range_requests(&server).await;
    assert!(
        ranges.iter().all(|(start, _)| *start >= 262_144),
        "recorded bytes must not be fetched again: {:?}",
        ranges
    );
    let refetched: u64 = ranges.iter().map(|(start, end)| end + 1 - start).sum();
    assert_eq!(refetched, 1_048_576 - 262_144);
}

#[tokio::test]
async fn test_completed_download_is_a_noop_on_rerun() {
    let body = generate_test_data(65_536);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/abc"))
        .respond_with(RangeResponder {
            body: body.clone(),
            file_name: None,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = make_client(&server, &dir);

    let first = client.download(vec!["abc".to_string()]).await;
    assert!(first.errors.is_empty());
    let after_first = server.received_requests().await.unwrap().len();
    let bytes_first = std::fs::read(dir.path().join("abc")).unwrap();

    let second = client.download(vec!["abc".to_string()]).await;
    assert!(second.errors.is_empty());
    assert_eq!(second.downloaded.len(), 1);

    // re-running costs one metadata probe and no ranges
    let after_second = server.received_requests().await.unwrap().len();
    assert_eq!(after_second, after_first + 1);

    let bytes_second = std::fs::read(dir.path().join("abc")).unwrap();
    assert_eq!(bytes_first, bytes_second);
}

// ---------------------------------------------------------------
// failure isolation
// ---------------------------------------------------------------

#[tokio::test]
async fn test_forbidden_file_does_not_poison_the_batch() {
    let body = generate_test_data(16_384);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(RangeResponder {
            body: body.clone(),
            file_name: None,
        })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = make_client(&server, &dir);
    let report = client
        .download(vec!["bad".to_string(), "good".to_string()])
        .await;

    assert_eq!(
        report.downloaded.iter().cloned().collect::<Vec<_>>(),
        vec!["good".to_string()]
    );
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors["bad"].contains("authentication"));

    let output = std::fs::read(dir.path().join("good")).unwrap();
    assert_eq!(output, body);
}

#[tokio::test]
async fn test_missing_file_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = make_client(&server, &dir);
    let report = client.download(vec!["gone".to_string()]).await;

    assert!(report.downloaded.is_empty());
    assert!(report.errors["gone"].contains("404"));
}

// ---------------------------------------------------------------
// secondary endpoints
// ---------------------------------------------------------------

#[tokio::test]
async fn test_related_files_join_the_batch() {
    let body_a = generate_test_data(16_384);
    let body_b = generate_test_data(32_768);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(RangeResponder {
            body: body_a,
            file_name: None,
        })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(RangeResponder {
            body: body_b.clone(),
            file_name: None,
        })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a/related"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "related_files": ["b"]
            })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b/related"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "related_files": []
            })),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = HttpClient::builder(server.uri(), "secret-token")
        .with_worker_count(2)
        .with_directory(dir.path())
        .with_download_related_files(true)
        .build()
        .unwrap();
    let report = client.download(vec!["a".to_string()]).await;

    assert_eq!(
        report.downloaded.iter().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "b".to_string()]
    );
    let output = std::fs::read(dir.path().join("b")).unwrap();
    assert_eq!(output, body_b);
}

#[tokio::test]
async fn test_annotations_are_saved_beside_the_download() {
    let body = generate_test_data(8192);
    let annotations = serde_json::json!({ "annotations": [{ "id": "note-1" }] });
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/abc"))
        .respond_with(RangeResponder {
            body,
            file_name: None,
        })
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/abc/annotations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(annotations.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = HttpClient::builder(server.uri(), "secret-token")
        .with_worker_count(2)
        .with_directory(dir.path())
        .with_download_annotations(true)
        .build()
        .unwrap();
    let report = client.download(vec!["abc".to_string()]).await;
    assert!(report.errors.is_empty());

    let saved = std::fs::read(dir.path().join("abc.annotations.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&saved).unwrap();
    assert_eq!(parsed, annotations);
}

// ---------------------------------------------------------------
// checksum resume end to end
// ---------------------------------------------------------------

#[tokio::test]
async fn test_checksum_resume_redownloads_only_the_corrupt_range() {
    let body = generate_test_data(1_048_576);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/abc"))
        .respond_with(RangeResponder {
            body: body.clone(),
            file_name: None,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let build = |server: &MockServer| {
        HttpClient::builder(server.uri(), "secret-token")
            .with_worker_count(4)
            .with_directory(dir.path())
            .with_http_chunk_size(65536)
            .with_small_file_threshold(0)
            .with_segment_md5sums(true)
            .build()
            .unwrap()
    };

    let first = build(&server).download(vec!["abc".to_string()]).await;
    assert!(first.errors.is_empty());
    let requests_after_first = server.received_requests().await.unwrap().len();

    // corrupt one chunk on disk, leaving the state file alone
    let output_path = dir.path().join("abc");
    let mut on_disk = std::fs::read(&output_path).unwrap();
    for byte in &mut on_disk[131_072..196_608] {
        *byte ^= 0xFF;
    }
    std::fs::write(&output_path, &on_disk).unwrap();

    let second = build(&server).download(vec!["abc".to_string()]).await;
    assert!(second.errors.is_empty());

    let repaired = std::fs::read(&output_path).unwrap();
    assert_eq!(repaired, body);

    // only the corrupt chunk was fetched again
    let refetched: u64 = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .skip(requests_after_first)
        .filter_map(|request| {
            let header = request.headers.get(&reqwest::header::RANGE)?;
            let (start, end) = parse_range(header.to_str().ok()?, usize::MAX)?;
            Some(end as u64 + 1 - start as u64)
        })
        .sum();
    assert_eq!(refetched, 65_536);
}

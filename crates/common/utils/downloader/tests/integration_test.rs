// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use axum_test::TestServer;
use base64::{Engine, engine::general_purpose::STANDARD};
use blockdelta_downloader::{
    BlockMap, BlockMaps, DifferentialDownloader, DownloadError, DownloadOutcome, DownloadSession,
    DownloaderConfig, EmbeddedBlockMapSource, ErrorClass, ExternalBlockMapSource, MultiRangeConfig,
    ProgressCallback, SequentialConfig, source::append_embedded_block_map,
};
use jiff::SignedDuration;
use reqwest::Url;
use sha2::{Digest, Sha512};
use tempfile::TempDir;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio_util::sync::CancellationToken;

const BLOCK_SIZE: u32 = 1024;
const BOUNDARY: &str = "blockdelta-test-boundary";
const ARTIFACT: &str = "/v/1.1.0/app-1.1.0.bin";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Serves ranges faithfully
    Honest,
    /// Ignores `Range` and never advertises range support
    NoRanges,
    /// Drops the last byte of the first multipart part
    ShortPart,
}

#[derive(Clone)]
struct GetHooks {
    started: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    release: Arc<Notify>,
}

#[derive(Clone)]
struct AppState {
    content:   Arc<Vec<u8>>,
    old_map:   Bytes,
    new_map:   Bytes,
    mode:      Mode,
    requests:  Arc<AtomicUsize>,
    multipart: Arc<AtomicUsize>,
    hooks:     Option<GetHooks>,
}

async fn handle_artifact(headers: HeaderMap, State(state): State<AppState>) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if let Some(hooks) = state.hooks.as_ref() {
        let mut sender = hooks.started.lock().await;
        if let Some(tx) = sender.take() {
            let _ = tx.send(());
        }
        drop(sender);
        hooks.release.notified().await;
    }

    let content = &state.content;
    let ranges = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_ranges(value, content.len()));

    let ranges = match (state.mode, ranges) {
        (Mode::NoRanges, _) | (_, None) => {
            let mut response_headers = HeaderMap::new();
            if state.mode != Mode::NoRanges {
                response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            }
            return (
                StatusCode::OK,
                response_headers,
                Bytes::copy_from_slice(content),
            )
                .into_response();
        }
        (_, Some(ranges)) => ranges,
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let [(start, end)] = ranges.as_slice() {
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{}", content.len())).unwrap(),
        );
        return (
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            Bytes::copy_from_slice(&content[*start..=*end]),
        )
            .into_response();
    }

    state.multipart.fetch_add(1, Ordering::SeqCst);
    let mut body = Vec::new();
    for (index, (start, end)) in ranges.iter().enumerate() {
        body.extend_from_slice(
            format!(
                "\r\n--{BOUNDARY}\r\nContent-Type: application/octet-stream\r\nContent-Range: \
                 bytes {start}-{end}/{}\r\n\r\n",
                content.len()
            )
            .as_bytes(),
        );
        let part = &content[*start..=*end];
        if index == 0 && state.mode == Mode::ShortPart {
            body.extend_from_slice(&part[..part.len() - 1]);
        } else {
            body.extend_from_slice(part);
        }
    }
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&format!("multipart/byteranges; boundary={BOUNDARY}")).unwrap(),
    );
    (StatusCode::PARTIAL_CONTENT, response_headers, Bytes::from(body)).into_response()
}

async fn handle_old_map(State(state): State<AppState>) -> Bytes { state.old_map.clone() }

async fn handle_new_map(State(state): State<AppState>) -> Bytes { state.new_map.clone() }

async fn handle_redirect() -> Redirect { Redirect::temporary(ARTIFACT) }

fn parse_ranges(value: &str, total: usize) -> Option<Vec<(usize, usize)>> {
    let value = value.strip_prefix("bytes=")?;
    value
        .split(',')
        .map(|range| {
            let (start, end) = range.trim().split_once('-')?;
            if start.is_empty() {
                let len: usize = end.parse().ok()?;
                return (len > 0 && len <= total).then(|| (total - len, total - 1));
            }
            let start: usize = start.parse().ok()?;
            let end: usize = end.parse().ok()?;
            (start <= end && end < total).then_some((start, end))
        })
        .collect()
}

fn create_temp_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("blockdelta-{prefix}-"))
        .tempdir()
        .expect("failed to create temp dir")
}

fn create_test_server(state: AppState) -> TestServer {
    let app = Router::new()
        .route(ARTIFACT, get(handle_artifact))
        .route("/v/1.1.0/app-1.1.0.bin.blockmap", get(handle_new_map))
        .route("/v/1.0.0/app-1.0.0.bin.blockmap", get(handle_old_map))
        .route("/latest/app.bin", get(handle_redirect))
        .with_state(state);

    TestServer::builder()
        .http_transport()
        .build(app)
        .expect("failed to create test server")
}

fn url_for(server: &TestServer, path: &str) -> Url {
    let base = server
        .server_address()
        .expect("server should have HTTP address")
        .to_string();
    Url::parse(base.trim_end_matches('/'))
        .and_then(|base| base.join(path))
        .expect("valid url")
}

/// Deterministic pseudo-random bytes.
fn pseudo_random(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            (state >> 33) as u8
        })
        .collect()
}

/// Old payload plus a new payload where every third block changed and a
/// partial block was appended.
fn payloads() -> (Vec<u8>, Vec<u8>) {
    let old = pseudo_random(7, 64 * BLOCK_SIZE as usize);
    let mut new = old.clone();
    for block in (1..64).step_by(3) {
        let start = block * BLOCK_SIZE as usize;
        for byte in &mut new[start..start + 16] {
            *byte ^= 0xa5;
        }
    }
    new.extend_from_slice(&pseudo_random(11, 500));
    (old, new)
}

fn sha512_base64(data: &[u8]) -> String { STANDARD.encode(Sha512::digest(data)) }

struct Fixture {
    server:    TestServer,
    requests:  Arc<AtomicUsize>,
    multipart: Arc<AtomicUsize>,
    dir:       TempDir,
    new:       Vec<u8>,
    old_map:   BlockMap,
    new_map:   BlockMap,
}

impl Fixture {
    fn external(mode: Mode) -> Self { Self::with_hooks(mode, None) }

    fn with_hooks(mode: Mode, hooks: Option<GetHooks>) -> Self {
        let (old, new) = payloads();
        let old_map = BlockMap::from_fixed_blocks("app.bin", &old, BLOCK_SIZE);
        let new_map = BlockMap::from_fixed_blocks("app.bin", &new, BLOCK_SIZE);
        Self::serve(mode, hooks, old, new, old_map, new_map)
    }

    /// Both artifacts carry their block map in a trailer.
    fn embedded() -> Self {
        let (old_payload, new_payload) = payloads();
        let old_map = BlockMap::from_fixed_blocks("app.bin", &old_payload, BLOCK_SIZE);
        let new_map = BlockMap::from_fixed_blocks("app.bin", &new_payload, BLOCK_SIZE);
        let mut old = old_payload;
        append_embedded_block_map(&mut old, &old_map).unwrap();
        let mut new = new_payload;
        append_embedded_block_map(&mut new, &new_map).unwrap();
        Self::serve(Mode::Honest, None, old, new, old_map, new_map)
    }

    fn serve(
        mode: Mode,
        hooks: Option<GetHooks>,
        old: Vec<u8>,
        new: Vec<u8>,
        old_map: BlockMap,
        new_map: BlockMap,
    ) -> Self {
        let requests = Arc::new(AtomicUsize::new(0));
        let multipart = Arc::new(AtomicUsize::new(0));
        let server = create_test_server(AppState {
            content: Arc::new(new.clone()),
            old_map: Bytes::from(old_map.encode_gzip().unwrap()),
            new_map: Bytes::from(new_map.encode_gzip().unwrap()),
            mode,
            requests: requests.clone(),
            multipart: multipart.clone(),
            hooks,
        });

        let dir = create_temp_dir("it");
        std::fs::write(dir.path().join("old.bin"), &old).unwrap();

        Self {
            server,
            requests,
            multipart,
            dir,
            new,
            old_map,
            new_map,
        }
    }

    fn output(&self) -> std::path::PathBuf { self.dir.path().join("new.bin") }

    fn session(&self) -> DownloadSession {
        DownloadSession::builder()
            .old_file(self.dir.path().join("old.bin"))
            .new_url(url_for(&self.server, ARTIFACT))
            .output_path(self.output())
            .sha512(sha512_base64(&self.new))
            .new_size(self.new.len() as u64)
            .build()
    }

    fn source() -> ExternalBlockMapSource {
        ExternalBlockMapSource::builder()
            .old_version("1.0.0")
            .new_version("1.1.0")
            .build()
    }

    fn assert_no_output(&self) {
        assert!(!self.output().exists(), "output must not exist");
        assert!(
            !self.dir.path().join("new.bin.download").exists(),
            "partial output must be removed"
        );
    }
}

fn downloader(config: DownloaderConfig) -> DifferentialDownloader {
    blockdelta_common_telemetry::logging::init_default_ut_logging();
    DifferentialDownloader::new(config).expect("client builds")
}

async fn read(path: &Path) -> Vec<u8> { tokio::fs::read(path).await.unwrap() }

#[tokio::test]
async fn multi_range_round_trip() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(DownloaderConfig::default());

    let outcome = downloader
        .download(&Fixture::source(), &fixture.session())
        .await
        .unwrap();
    let result = outcome.completed().expect("download completes");

    assert_eq!(read(&result.path).await, fixture.new);
    assert_eq!(result.size, fixture.new.len() as u64);
    assert_eq!(result.sha512, sha512_base64(&fixture.new));
    assert!(result.summary.download_bytes < fixture.new.len() as u64);
    assert!(result.summary.download_operations > 1);
    assert_eq!(
        result.summary.download_bytes + result.summary.copy_bytes,
        fixture.new.len() as u64
    );
    // One combined request for all ranges.
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.multipart.load(Ordering::SeqCst), 1);
    assert!(!fixture.dir.path().join("new.bin.download").exists());
}

#[tokio::test]
async fn multi_range_requests_are_batched() {
    let fixture = Fixture::external(Mode::Honest);
    let config = DownloaderConfig::builder()
        .multi_range(MultiRangeConfig {
            enabled:                true,
            max_ranges_per_request: 10,
        })
        .build();
    let downloader = downloader(config);

    let result = downloader
        .download(&Fixture::source(), &fixture.session())
        .await
        .unwrap()
        .completed()
        .unwrap();

    let downloads = result.summary.download_operations;
    assert_eq!(downloads, 22);
    assert_eq!(read(&result.path).await, fixture.new);
    assert_eq!(fixture.requests.load(Ordering::SeqCst), downloads.div_ceil(10));
}

#[tokio::test]
async fn sequential_round_trip() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(DownloaderConfig::default());
    let mut session = fixture.session();
    session.multi_range = false;

    let transferred = Arc::new(AtomicU64::new(0));
    let counter = transferred.clone();
    session.progress = Some(ProgressCallback::new(move |info| {
        counter.fetch_add(info.delta, Ordering::SeqCst);
    }));

    let result = downloader
        .download(&Fixture::source(), &session)
        .await
        .unwrap()
        .completed()
        .unwrap();

    assert_eq!(read(&result.path).await, fixture.new);
    assert_eq!(
        fixture.requests.load(Ordering::SeqCst),
        result.summary.download_operations
    );
    assert_eq!(fixture.multipart.load(Ordering::SeqCst), 0);
    assert_eq!(
        transferred.load(Ordering::SeqCst),
        result.summary.download_bytes
    );
}

fn pausing_config(yield_every: usize, yield_delay: SignedDuration) -> DownloaderConfig {
    DownloaderConfig::builder()
        .sequential(SequentialConfig {
            yield_every,
            yield_delay,
        })
        .build()
}

#[tokio::test]
async fn sequential_pauses_between_parts() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(pausing_config(2, SignedDuration::from_millis(50)));
    let mut session = fixture.session();
    session.multi_range = false;

    let started = tokio::time::Instant::now();
    let result = downloader
        .download(&Fixture::source(), &session)
        .await
        .unwrap()
        .completed()
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(read(&result.path).await, fixture.new);
    let pauses = u32::try_from(result.summary.download_operations / 2).unwrap();
    assert_eq!(pauses, 11);
    assert!(
        elapsed >= std::time::Duration::from_millis(50) * pauses,
        "expected {pauses} pauses, finished in {elapsed:?}"
    );
}

#[tokio::test]
async fn cancellation_during_pause_cleans_up() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(pausing_config(1, SignedDuration::from_secs(3600)));
    let token = CancellationToken::new();
    let mut session = fixture.session();
    session.multi_range = false;
    session.cancellation = token.clone();

    let requests = fixture.requests.clone();
    let source = Fixture::source();
    let download = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        tokio::join!(downloader.download(&source, &session), async {
            while requests.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            // The first part is one block; let it land and the pause begin.
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            token.cancel();
        })
    });
    let (outcome, ()) = download.await.expect("cancellation interrupts the pause");

    assert!(matches!(outcome, Ok(DownloadOutcome::Cancelled)));
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 1);
    fixture.assert_no_output();
}

#[tokio::test]
async fn sequential_follows_redirects() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(DownloaderConfig::default());
    let mut session = fixture.session();
    session.multi_range = false;
    session.new_url = url_for(&fixture.server, "/latest/app.bin");

    let maps = BlockMaps {
        old:      fixture.old_map.clone(),
        new:      fixture.new_map.clone(),
        trailer:  None,
        new_size: None,
    };
    let result = downloader
        .download_with_block_maps(&session, &maps)
        .await
        .unwrap()
        .completed()
        .unwrap();

    assert_eq!(read(&result.path).await, fixture.new);
    // Only the first request goes through the redirect.
    assert_eq!(
        fixture.requests.load(Ordering::SeqCst),
        result.summary.download_operations
    );
}

#[tokio::test]
async fn embedded_block_maps_round_trip() {
    let fixture = Fixture::embedded();
    let downloader = downloader(DownloaderConfig::default());

    // Sizes unknown: the trailer length is read first.
    let mut session = fixture.session();
    session.new_size = None;
    let result = downloader
        .download(&EmbeddedBlockMapSource::default(), &session)
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(read(&result.path).await, fixture.new);
    assert_eq!(result.size, fixture.new.len() as u64);

    // Sizes known up front: a single ranged read fetches the trailer.
    tokio::fs::remove_file(&result.path).await.unwrap();
    let trailer_len = fixture.new_map.encode_raw_deflate().unwrap().len();
    let source = EmbeddedBlockMapSource::builder()
        .new_block_map_size(u32::try_from(trailer_len).unwrap())
        .new_file_size(fixture.new.len() as u64)
        .build();
    let result = downloader
        .download(&source, &fixture.session())
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(read(&result.path).await, fixture.new);
}

#[tokio::test]
async fn server_without_range_support_writes_nothing() {
    let fixture = Fixture::external(Mode::NoRanges);
    let downloader = downloader(DownloaderConfig::default());

    let err = downloader
        .download(&Fixture::source(), &fixture.session())
        .await
        .unwrap_err();

    assert!(
        matches!(err, DownloadError::RangeNotSupported { status: 200 }),
        "{err}"
    );
    assert_eq!(err.class(), ErrorClass::ServerCapability);
    assert!(err.should_fall_back());
    fixture.assert_no_output();
}

#[tokio::test]
async fn short_multipart_part_is_fatal() {
    let fixture = Fixture::external(Mode::ShortPart);
    let downloader = downloader(DownloaderConfig::default());

    let err = downloader
        .download(&Fixture::source(), &fixture.session())
        .await
        .unwrap_err();

    assert!(
        matches!(err, DownloadError::PartLengthMismatch { part: 0, .. }),
        "{err}"
    );
    assert_eq!(err.class(), ErrorClass::StreamIntegrity);
    fixture.assert_no_output();
}

#[tokio::test]
async fn checksum_mismatch_discards_output() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(DownloaderConfig::default());
    let mut session = fixture.session();
    session.sha512 = sha512_base64(b"something else entirely");

    let err = downloader
        .download(&Fixture::source(), &session)
        .await
        .unwrap_err();

    match &err {
        DownloadError::ChecksumMismatch { expected, actual } => {
            assert_eq!(expected, &session.sha512);
            assert_eq!(actual, &sha512_base64(&fixture.new));
        }
        other => panic!("unexpected error: {other}"),
    }
    fixture.assert_no_output();
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(DownloaderConfig::default());
    let mut new = fixture.new_map.clone();
    new.version = "3".to_string();
    let maps = BlockMaps {
        old: fixture.old_map.clone(),
        new,
        trailer: None,
        new_size: None,
    };

    let err = downloader
        .download_with_block_maps(&fixture.session(), &maps)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::VersionMismatch { .. }));
    assert!(err.should_fall_back());
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 0);
    fixture.assert_no_output();
}

#[tokio::test]
async fn size_accounting_mismatch_is_rejected() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(DownloaderConfig::default());
    let mut session = fixture.session();
    session.new_size = Some(fixture.new.len() as u64 + 1);

    let err = downloader
        .download(&Fixture::source(), &session)
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::SizeMismatch { .. }), "{err}");
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 0);
    fixture.assert_no_output();
}

#[tokio::test]
async fn cancellation_cleans_up() {
    let (tx, rx) = oneshot::channel();
    let hooks = GetHooks {
        started: Arc::new(Mutex::new(Some(tx))),
        release: Arc::new(Notify::new()),
    };
    let fixture = Fixture::with_hooks(Mode::Honest, Some(hooks.clone()));
    let downloader = downloader(DownloaderConfig::default());

    let token = CancellationToken::new();
    let mut session = fixture.session();
    session.cancellation = token.clone();

    let source = Fixture::source();
    let (outcome, ()) = tokio::join!(downloader.download(&source, &session), async {
        rx.await.expect("artifact request starts");
        token.cancel();
        hooks.release.notify_one();
    });

    assert!(matches!(outcome, Ok(DownloadOutcome::Cancelled)));
    fixture.assert_no_output();
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let fixture = Fixture::external(Mode::Honest);
    let downloader = downloader(DownloaderConfig::default());
    let session = fixture.session();
    session.cancellation.cancel();

    let outcome = downloader
        .download(&Fixture::source(), &session)
        .await
        .unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(fixture.requests.load(Ordering::SeqCst), 0);
    fixture.assert_no_output();
}

//! End-to-end fetch scenarios against an in-process HTTP server.
//!
//! Each test builds the expected tree on disk, derives its digest
//! independently, serves matching archives over a loopback socket, and
//! drives a real `Fetcher` + `DirectoryStore` pipeline.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Cursor, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, UNIX_EPOCH};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use zerofetch::digest::ManifestDigest;
use zerofetch::manifest::{self, Manifest, ManifestFormat};
use zerofetch::scheduler::RetryPolicy;
use zerofetch::store::StoreError;
use zerofetch::{
    Archive, DirectoryStore, FetchError, FetchRequest, Fetcher, FetcherConfig, Implementation,
    Recipe, SilentHandler,
};

/// 2020-01-02 03:04:04 UTC; an even second, representable in DOS time.
const ENTRY_MTIME: i64 = 1_577_934_244;

// ---------------------------------------------------------------------------
// Loopback HTTP server
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Route {
    body: Vec<u8>,
    range_supported: bool,
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
}

struct TestServer {
    port: u16,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl TestServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let routes: Arc<Mutex<HashMap<String, Route>>> = Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let thread_routes = Arc::clone(&routes);
        let thread_requests = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let routes = Arc::clone(&thread_routes);
                let requests = Arc::clone(&thread_requests);
                thread::spawn(move || {
                    let _ = handle_connection(stream, &routes, &requests);
                });
            }
        });

        Self {
            port,
            routes,
            requests,
        }
    }

    fn serve(&self, path: &str, body: Vec<u8>, range_supported: bool) -> String {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            Route {
                body,
                range_supported,
            },
        );
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

fn handle_connection(
    stream: TcpStream,
    routes: &Mutex<HashMap<String, Route>>,
    requests: &Mutex<Vec<RecordedRequest>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        headers: headers.clone(),
    });

    let route = routes.lock().unwrap().get(&path).cloned();
    let Some(route) = route else {
        stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")?;
        return Ok(());
    };

    let total = route.body.len();
    let range_start = headers
        .get("range")
        .filter(|_| route.range_supported)
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.strip_suffix('-'))
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|start| *start <= total);

    let accept_ranges = if route.range_supported {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };

    match range_start {
        Some(start) => {
            let slice = &route.body[start..];
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n{}Connection: close\r\n\r\n",
                slice.len(),
                start,
                total.saturating_sub(1),
                total,
                accept_ranges,
            );
            stream.write_all(head.as_bytes())?;
            if method != "HEAD" {
                stream.write_all(slice)?;
            }
        }
        None => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
                total, accept_ranges,
            );
            stream.write_all(head.as_bytes())?;
            if method != "HEAD" {
                stream.write_all(&route.body)?;
            }
        }
    }
    stream.flush()
}

// ---------------------------------------------------------------------------
// Tree and archive builders
// ---------------------------------------------------------------------------

/// (relative path, contents, executable)
type Entry<'a> = (&'a str, &'a [u8], bool);

const SIMPLE_TREE: &[Entry<'static>] = &[
    ("file1", b"AAAA", false),
    ("folder1/file2", b"dskf\nsdf\n", false),
    ("folder2/file3", b"\x37\x37\x37", false),
];

/// Materialize entries on disk with the fixed entry mtime.
fn build_tree(root: &Path, entries: &[Entry<'_>]) {
    for (path, contents, executable) in entries {
        let dest = root.join(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = File::create(&dest).unwrap();
        file.write_all(contents).unwrap();
        #[cfg(unix)]
        if *executable {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = executable;
        File::options()
            .write(true)
            .open(&dest)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(ENTRY_MTIME as u64))
            .unwrap();
    }
}

/// Digest of the given entries, derived from an independent on-disk tree.
fn expected_digest(entries: &[Entry<'_>]) -> ManifestDigest {
    let temp = TempDir::new().unwrap();
    build_tree(temp.path(), entries);
    let manifest = manifest::generate(temp.path(), ManifestFormat::Sha256New).unwrap();
    ManifestDigest::from_string(&manifest.digest()).unwrap()
}

/// A ZIP holding the given entries, with the fixed entry mtime.
fn build_zip(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let timestamp = zip::DateTime::from_date_and_time(2020, 1, 2, 3, 4, 4).unwrap();
    for (path, contents, executable) in entries {
        let mut options = SimpleFileOptions::default().last_modified_time(timestamp);
        if *executable {
            options = options.unix_permissions(0o755);
        }
        writer.start_file(*path, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

struct Harness {
    _temp: TempDir,
    store: Arc<DirectoryStore>,
    fetcher: Fetcher,
    server: TestServer,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let temp = TempDir::new().unwrap();
        let store = Arc::new(DirectoryStore::open(temp.path().join("store")).unwrap());
        let config = FetcherConfig::new()
            .with_timeout(Duration::from_secs(10))
            .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));
        let fetcher = Fetcher::new(Arc::clone(&store), config, Arc::new(SilentHandler));
        Self {
            _temp: temp,
            store,
            fetcher,
            server: TestServer::start(),
        }
    }

    /// Non-dot entries in the store root (installed implementations and
    /// any leaked staging directories).
    fn store_entries(&self) -> Vec<String> {
        fs::read_dir(self.store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_fetch_simple_archive() {
    let harness = Harness::new();
    let body = build_zip(SIMPLE_TREE);
    let size = body.len() as u64;
    let url = harness.server.serve("/impl.zip", body, false);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation =
        Implementation::new(digest.clone()).with_archive(Archive::new(url, size));

    harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap();

    assert!(harness.store.contains(&digest));
    let installed = harness.store.path(&digest).unwrap();
    assert_eq!(fs::read(installed.join("file1")).unwrap(), b"AAAA");
    assert_eq!(
        fs::read(installed.join("folder1/file2")).unwrap(),
        b"dskf\nsdf\n"
    );
    assert_eq!(fs::read(installed.join("folder2/file3")).unwrap(), b"777");

    // The stored manifest round-trips and reproduces the digest.
    let loaded = Manifest::load(&installed, ManifestFormat::Sha256New).unwrap();
    assert_eq!(loaded.digest(), digest.best_string().unwrap());
}

#[test]
fn test_fetch_twice_is_noop() {
    let harness = Harness::new();
    let body = build_zip(SIMPLE_TREE);
    let size = body.len() as u64;
    let url = harness.server.serve("/impl.zip", body, false);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation =
        Implementation::new(digest.clone()).with_archive(Archive::new(url, size));
    let request = FetchRequest::single(implementation);

    harness.fetcher.fetch(&request).unwrap();
    assert_eq!(harness.server.count("GET", "/impl.zip"), 1);

    harness.fetcher.fetch(&request).unwrap();
    assert_eq!(harness.server.count("GET", "/impl.zip"), 1, "no re-download");
    assert!(harness.store.contains(&digest));
}

#[test]
fn test_size_mismatch_rejected() {
    let harness = Harness::new();
    let body = build_zip(SIMPLE_TREE);
    let wrong_size = body.len() as u64 + 7;
    let url = harness.server.serve("/impl.zip", body, false);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation =
        Implementation::new(digest.clone()).with_archive(Archive::new(url, wrong_size));

    let err = harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap_err();
    match err {
        FetchError::SizeMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, wrong_size);
            assert_eq!(actual, wrong_size - 7);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!harness.store.contains(&digest));
    assert!(harness.store_entries().is_empty(), "no staging left behind");
}

#[test]
fn test_digest_mismatch_rejected() {
    let harness = Harness::new();
    let body = build_zip(SIMPLE_TREE);
    let size = body.len() as u64;
    let url = harness.server.serve("/impl.zip", body, false);

    let wrong =
        ManifestDigest::from_string("sha256new=notthedigestnotthedigestnotthedigest23456789012345")
            .unwrap();
    let implementation = Implementation::new(wrong.clone()).with_archive(Archive::new(url, size));

    let err = harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap_err();
    match err {
        FetchError::Store(StoreError::DigestMismatch {
            expected, actual, ..
        }) => {
            assert_eq!(expected, wrong.best_string().unwrap());
            assert_eq!(actual, expected_digest(SIMPLE_TREE).best_string().unwrap());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!harness.store.contains(&wrong));
    assert!(harness.store_entries().is_empty(), "staging was deleted");
}

#[test]
fn test_self_extracting_archive_with_range_support() {
    let harness = Harness::new();
    let zip = build_zip(SIMPLE_TREE);
    let size = zip.len() as u64;
    let mut body = vec![0x5a; 0x1000];
    body.extend_from_slice(&zip);
    let url = harness.server.serve("/installer.exe", body, true);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation = Implementation::new(digest.clone())
        .with_archive(Archive::new(url, size).with_start_offset(0x1000));

    harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap();
    assert!(harness.store.contains(&digest));

    // The prefix bytes never travelled: the GET carried a range request.
    let ranged_get = harness
        .server
        .requests()
        .into_iter()
        .find(|r| r.method == "GET" && r.path == "/installer.exe")
        .unwrap();
    assert_eq!(
        ranged_get.headers.get("range").map(String::as_str),
        Some("bytes=4096-")
    );
}

#[test]
fn test_self_extracting_archive_without_range_support() {
    let harness = Harness::new();
    let zip = build_zip(SIMPLE_TREE);
    let size = zip.len() as u64;
    let mut body = vec![0x5a; 0x1000];
    body.extend_from_slice(&zip);
    let url = harness.server.serve("/installer.exe", body, false);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation = Implementation::new(digest.clone())
        .with_archive(Archive::new(url, size).with_start_offset(0x1000));

    harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap();

    // Fallback: the whole resource travelled and the extractor skipped
    // the prefix; the resulting tree is identical.
    assert!(harness.store.contains(&digest));
    let get = harness
        .server
        .requests()
        .into_iter()
        .find(|r| r.method == "GET" && r.path == "/installer.exe")
        .unwrap();
    assert!(!get.headers.contains_key("range"));
}

#[test]
fn test_recipe_overlays_archives_in_order() {
    let harness = Harness::new();
    let part1_entries: &[Entry<'_>] = &[("FILE1", b"This file was in part1", false)];
    let part2_entries: &[Entry<'_>] = &[("FILE2", b"This file was in part2", false)];
    let merged: &[Entry<'_>] = &[
        ("FILE1", b"This file was in part1", false),
        ("FILE2", b"This file was in part2", false),
    ];

    let part1 = build_zip(part1_entries);
    let part2 = build_zip(part2_entries);
    let part1_size = part1.len() as u64;
    let part2_size = part2.len() as u64;
    let url1 = harness.server.serve("/part1.zip", part1, false);
    let url2 = harness.server.serve("/part2.zip", part2, false);

    let digest = expected_digest(merged);
    let implementation = Implementation::new(digest.clone()).with_recipe(Recipe::new(vec![
        Archive::new(url1, part1_size),
        Archive::new(url2, part2_size),
    ]));

    harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap();

    assert!(harness.store.contains(&digest));
    let installed = harness.store.path(&digest).unwrap();
    assert_eq!(
        fs::read(installed.join("FILE1")).unwrap(),
        b"This file was in part1"
    );
    assert_eq!(
        fs::read(installed.join("FILE2")).unwrap(),
        b"This file was in part2"
    );
}

#[cfg(unix)]
#[test]
fn test_executable_bit_survives_fetch() {
    let harness = Harness::new();
    let entries: &[Entry<'_>] = &[
        ("README-SDL.txt", b"docs", false),
        ("SDL.dll", b"not actually code", true),
    ];
    let body = build_zip(entries);
    let size = body.len() as u64;
    let url = harness.server.serve("/sdl.zip", body, false);

    let digest = expected_digest(entries);
    let implementation =
        Implementation::new(digest.clone()).with_archive(Archive::new(url, size));
    harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap();

    let installed = harness.store.path(&digest).unwrap();
    let manifest_text = fs::read_to_string(installed.join(".manifest")).unwrap();
    assert!(manifest_text
        .lines()
        .any(|l| l.starts_with("F ") && l.ends_with("README-SDL.txt")));
    assert!(manifest_text
        .lines()
        .any(|l| l.starts_with("X ") && l.ends_with("SDL.dll")));
}

#[test]
fn test_remove_then_fetch_again() {
    let harness = Harness::new();
    let body = build_zip(SIMPLE_TREE);
    let size = body.len() as u64;
    let url = harness.server.serve("/impl.zip", body, false);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation =
        Implementation::new(digest.clone()).with_archive(Archive::new(url, size));
    let request = FetchRequest::single(implementation);

    harness.fetcher.fetch(&request).unwrap();
    harness.store.remove(&digest).unwrap();
    assert!(!harness.store.contains(&digest));

    harness.fetcher.fetch(&request).unwrap();
    assert!(harness.store.contains(&digest));
    assert_eq!(harness.server.count("GET", "/impl.zip"), 2);
}

#[test]
fn test_concurrent_fetches_download_once() {
    let harness = Harness::new();
    let body = build_zip(SIMPLE_TREE);
    let size = body.len() as u64;
    let url = harness.server.serve("/impl.zip", body, false);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation =
        Implementation::new(digest.clone()).with_archive(Archive::new(url, size));
    let request = FetchRequest::single(implementation);

    let fetcher = Arc::new(harness.fetcher);
    let mut workers = Vec::new();
    for _ in 0..4 {
        let fetcher = Arc::clone(&fetcher);
        let request = request.clone();
        workers.push(thread::spawn(move || fetcher.fetch(&request)));
    }
    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert!(harness.store.contains(&digest));
    assert_eq!(
        harness.server.count("GET", "/impl.zip"),
        1,
        "exactly one fetch performed I/O"
    );
}

#[test]
fn test_store_verify_after_fetch() {
    let harness = Harness::new();
    let body = build_zip(SIMPLE_TREE);
    let size = body.len() as u64;
    let url = harness.server.serve("/impl.zip", body, false);

    let digest = expected_digest(SIMPLE_TREE);
    let implementation = Implementation::new(digest).with_archive(Archive::new(url, size));
    harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap();

    let report = harness.store.verify(&SilentHandler).unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.is_clean());
}

#[test]
fn test_unreachable_server_is_network_error() {
    let harness = Harness::new();
    let digest = expected_digest(SIMPLE_TREE);
    // Nothing listens on the reserved discard port.
    let implementation = Implementation::new(digest.clone())
        .with_archive(Archive::new("http://127.0.0.1:9/impl.zip", 64));

    let err = harness
        .fetcher
        .fetch(&FetchRequest::single(implementation))
        .unwrap_err();
    assert!(matches!(err, FetchError::Network { .. }), "got {err}");
    assert!(!harness.store.contains(&digest));
}

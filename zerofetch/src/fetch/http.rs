//! Blocking HTTP transfer with ranged resume.
//!
//! One [`HttpTransfer`] serves all downloads of a fetcher. Requests with
//! a non-zero offset (a self-extracting prefix to skip, or bytes already
//! on disk from a paused attempt) send `Range: bytes=<offset>-` and
//! expect `206 Partial Content`; a `200 OK` means the server ignored the
//! range and the file restarts from byte zero.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::progress::TaskHandler;
use crate::scheduler::{FileOutcome, FileSpec, StopKind, Transfer, TransferControl};

use super::FetchError;

/// Buffer size for streaming downloads (64 KiB); cancellation and pause
/// are polled once per buffer.
const BUFFER_SIZE: usize = 64 * 1024;

/// HTTP implementation of the scheduler's [`Transfer`] seam.
pub struct HttpTransfer {
    client: Client,
    handler: Arc<dyn TaskHandler>,
}

impl HttpTransfer {
    pub fn new(timeout: Duration, handler: Arc<dyn TaskHandler>) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");
        Self { client, handler }
    }

    /// Query size and range support via a `HEAD` request.
    ///
    /// Returns `(content_length, supports_range)`; an unknown length is 0.
    pub fn probe(&self, url: &str) -> Result<(u64, bool), FetchError> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|e| FetchError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Network {
                url: url.to_string(),
                reason: format!("HEAD request failed with status {}", response.status()),
            });
        }

        let size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let supports_range = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .map(|v| v.to_str().unwrap_or("") == "bytes")
            .unwrap_or(false);
        Ok((size, supports_range))
    }

    fn open_destination(
        &self,
        dest: &Path,
        append: bool,
    ) -> Result<File, std::io::Error> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if append {
            OpenOptions::new().append(true).create(true).open(dest)
        } else {
            File::create(dest)
        }
    }
}

impl Transfer for HttpTransfer {
    fn run(&self, spec: &FileSpec, resume_from: u64, ctl: &TransferControl) -> FileOutcome {
        let offset = spec.range_start + resume_from;
        self.handler.starting_download(&spec.url);

        let mut request = self.client.get(&spec.url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let mut response = match request.send() {
            Ok(response) => response,
            Err(e) => {
                return FileOutcome::Failed {
                    reason: e.to_string(),
                    retryable: true,
                }
            }
        };

        // A ranged request answered with 200 means the server ignored the
        // range: restart from byte zero of the whole resource.
        let status = response.status();
        let (mut written, ranged) = match status {
            StatusCode::PARTIAL_CONTENT => (resume_from, true),
            StatusCode::OK => {
                if offset > 0 {
                    debug!(url = %spec.url, "server ignored range request, restarting from zero");
                }
                (0, spec.range_start == 0)
            }
            other => {
                return FileOutcome::Failed {
                    reason: format!("GET request failed with status {}", other),
                    retryable: other.is_server_error(),
                }
            }
        };

        let file = match self.open_destination(&spec.dest, written > 0) {
            Ok(file) => file,
            Err(e) => {
                return FileOutcome::Failed {
                    reason: e.to_string(),
                    retryable: false,
                }
            }
        };
        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let total = response.content_length().map(|len| written + len);

        loop {
            if self.handler.is_cancelled() {
                drop(writer);
                discard_partial(spec);
                return FileOutcome::Cancelled;
            }
            match ctl.stop_requested() {
                Some(StopKind::Cancel) => {
                    drop(writer);
                    discard_partial(spec);
                    return FileOutcome::Cancelled;
                }
                Some(StopKind::Pause) if spec.supports_resume => {
                    if let Err(e) = writer.flush() {
                        return FileOutcome::Failed {
                            reason: e.to_string(),
                            retryable: false,
                        };
                    }
                    debug!(url = %spec.url, bytes = written, "transfer paused");
                    return FileOutcome::Paused { bytes: written };
                }
                _ => {}
            }

            let bytes_read = match response.read(&mut buffer) {
                Ok(n) => n,
                Err(e) => {
                    warn!(url = %spec.url, error = %e, "read error during download");
                    return FileOutcome::Failed {
                        reason: e.to_string(),
                        retryable: true,
                    };
                }
            };
            if bytes_read == 0 {
                break;
            }

            if let Err(e) = writer.write_all(&buffer[..bytes_read]) {
                return FileOutcome::Failed {
                    reason: e.to_string(),
                    retryable: false,
                };
            }
            written += bytes_read as u64;
            ctl.set_bytes(written);
            self.handler.download_progress(&spec.url, written, total);
        }

        if let Err(e) = writer.flush() {
            return FileOutcome::Failed {
                reason: e.to_string(),
                retryable: false,
            };
        }
        FileOutcome::Complete {
            bytes: written,
            ranged,
        }
    }
}

/// Cancelled transfers keep partial bytes only when resumable.
fn discard_partial(spec: &FileSpec) {
    if !spec.supports_resume {
        if let Err(e) = fs::remove_file(&spec.dest) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dest = %spec.dest.display(), error = %e, "failed to discard partial download");
            }
        }
    }
}

//! Dataset fetch with an md5-verified local cache.
//!
//! The network sits behind [`Transport`] so the cache logic can be exercised
//! without it.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CHUNK: usize = 1 << 20;
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transfer from '{url}' failed: {message}")]
    Transfer { url: String, message: String },

    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("checksum mismatch for '{path}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Source of a response body.
pub trait Transport {
    fn open(&self, url: &str) -> Result<Box<dyn Read>, FetchError>;
}

/// Blocking HTTP(S) GET.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str) -> Result<Box<dyn Read>, FetchError> {
        // ureq reports non-2xx statuses as `Error::Status`.
        let response = self.agent.get(url).call().map_err(|e| FetchError::Transfer {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Box::new(response.into_reader()))
    }
}

/// Lowercase hex md5 of a file, read in 1 MiB chunks.
pub fn md5_file(path: &Path) -> Result<String, FetchError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut reader = BufReader::with_capacity(CHUNK, file);
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// What [`fetch_dataset`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    CacheHit(PathBuf),
    Downloaded(PathBuf),
}

impl FetchOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::CacheHit(p) | Self::Downloaded(p) => p,
        }
    }
}

fn partial_path(out_path: &Path) -> PathBuf {
    let mut name = out_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Streams `body` into `sink` in chunks; returns the byte count.
fn copy_body(
    url: &str,
    body: &mut dyn Read,
    sink_path: &Path,
    sink: &mut impl Write,
) -> Result<usize, FetchError> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0usize;
    loop {
        let n = body.read(&mut buf).map_err(|e| FetchError::Transfer {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).map_err(|e| io_err(sink_path, e))?;
        total += n;
    }
    sink.flush().map_err(|e| io_err(sink_path, e))?;
    Ok(total)
}

/// Ensures `out_path` holds the dataset at `url`.
///
/// With an expected md5 and an existing file whose digest matches
/// (case-insensitive), nothing is fetched. Otherwise the body is streamed
/// into `<out_path>.part`, verified, and renamed into place. A failed
/// transfer, write or checksum removes the partial file.
pub fn fetch_dataset(
    url: &str,
    out_path: &Path,
    expected_md5: Option<&str>,
    transport: &dyn Transport,
) -> Result<FetchOutcome, FetchError> {
    if let Some(parent) = out_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    if out_path.exists() && let Some(expected) = expected_md5 {
        let actual = md5_file(out_path)?;
        if actual.eq_ignore_ascii_case(expected.trim()) {
            log::info!("dataset cache hit: {}", out_path.display());
            return Ok(FetchOutcome::CacheHit(out_path.to_path_buf()));
        }
        log::warn!(
            "cached '{}' has md5 {actual}, expected {expected}; downloading again",
            out_path.display()
        );
    }

    log::info!("downloading {url} -> {}", out_path.display());
    let part = partial_path(out_path);
    let mut body = transport.open(url)?;
    let copied = File::create(&part)
        .map_err(|e| io_err(&part, e))
        .and_then(|mut file| copy_body(url, body.as_mut(), &part, &mut file));
    match copied {
        Ok(total) => log::debug!("received {total} bytes"),
        Err(e) => {
            let _ = std::fs::remove_file(&part);
            return Err(e);
        }
    }

    if let Some(expected) = expected_md5 {
        let actual = md5_file(&part)?;
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            let _ = std::fs::remove_file(&part);
            return Err(FetchError::ChecksumMismatch {
                path: out_path.display().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    std::fs::rename(&part, out_path).map_err(|e| io_err(out_path, e))?;
    log::info!("dataset saved to {}", out_path.display());
    Ok(FetchOutcome::Downloaded(out_path.to_path_buf()))
}

//! Access to the content behind a rule source.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::config::{Item, ItemState};

/// Characters escaped in cache file names. Matches form encoding, which
/// keeps `.`, `-`, `_` and `*` and writes a space as `+`.
const CACHE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'-').remove(b'_').remove(b'*');

/// One entry of the ordered list of host sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    pub location: String,
    pub state: ItemState,
}

impl RuleSource {
    pub fn new(location: impl Into<String>, state: ItemState) -> Self {
        Self {
            location: location.into(),
            state,
        }
    }
}

impl From<&Item> for RuleSource {
    fn from(item: &Item) -> Self {
        Self::new(item.location.clone(), item.state)
    }
}

/// Opens the content of a rule source.
///
/// `Ok(None)` means the location has no backing content and is itself a
/// single host name. `Err` with `NotFound` marks a source that should be
/// skipped.
pub trait SourceOpener {
    fn open(&self, source: &RuleSource) -> io::Result<Option<Box<dyn BufRead + Send>>>;
}

/// Opens sources from the local filesystem.
///
/// Remote lists are expected to have been downloaded into `cache_dir`
/// under their percent-encoded URL.
#[derive(Debug, Clone)]
pub struct FsSourceOpener {
    cache_dir: PathBuf,
}

impl FsSourceOpener {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Path a downloadable location is cached at.
    pub fn cache_path(&self, location: &str) -> PathBuf {
        let name = utf8_percent_encode(location, CACHE_NAME)
            .to_string()
            .replace("%20", "+");
        self.cache_dir.join(name)
    }

    fn open_file(path: &Path) -> io::Result<Option<Box<dyn BufRead + Send>>> {
        let file = File::open(path)?;
        Ok(Some(Box::new(BufReader::new(file))))
    }
}

impl SourceOpener for FsSourceOpener {
    fn open(&self, source: &RuleSource) -> io::Result<Option<Box<dyn BufRead + Send>>> {
        let location = source.location.as_str();

        if location.starts_with("https://") || location.starts_with("http://") {
            return Self::open_file(&self.cache_path(location));
        }
        if location.starts_with("content://") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "content providers are not available",
            ));
        }
        if let Some(path) = location.strip_prefix("file://") {
            return Self::open_file(Path::new(path));
        }
        if location.starts_with('/') {
            return Self::open_file(Path::new(location));
        }

        Ok(None)
    }
}

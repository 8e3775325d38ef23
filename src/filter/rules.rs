//! Database of blocked host names.
//!
//! Readers never block: the live set is an immutable snapshot behind an
//! `ArcSwap`. A rebuild constructs a complete replacement off to the side
//! and publishes it with a single atomic store.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use arc_swap::ArcSwap;
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, warn};

use super::source::{RuleSource, SourceOpener};
use super::RuleError;
use crate::config::{Configuration, ItemState};

/// Prefixes of hosts-file entries that point a name at nowhere.
const NULL_PREFIXES: [&str; 3] = ["127.0.0.1", "::1", "0.0.0.0"];

/// Extract the host from one line of a hosts-style list.
///
/// Comments run from `#` to the end of the line. A leading loopback or
/// null address is stripped when followed by whitespace. Lines whose host
/// field contains whitespace are rejected.
pub fn parse_line(line: &str) -> Option<String> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }

    let mut host = line;
    for prefix in NULL_PREFIXES {
        if let Some(rest) = line.strip_prefix(prefix) {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                host = rest;
                break;
            }
        }
    }

    let host = host.trim_start();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }

    Some(host.to_lowercase())
}

/// Outcome of a successful rebuild.
#[derive(Debug, Default)]
pub struct RebuildReport {
    /// Number of names in the published set.
    pub hosts: usize,
    /// Sources that could not be read; they were skipped.
    pub errors: Vec<RuleError>,
}

/// Set of blocked host names with lock-free lookups.
pub struct RuleDatabase {
    hosts: ArcSwap<FxHashSet<String>>,
    writer: Mutex<()>,
}

impl RuleDatabase {
    /// Create an empty database. Nothing is blocked until the first rebuild.
    pub fn new() -> Self {
        Self {
            hosts: ArcSwap::from_pointee(FxHashSet::default()),
            writer: Mutex::new(()),
        }
    }

    /// Check if a host is blocked, ignoring case.
    pub fn is_blocked(&self, host: &str) -> bool {
        let hosts = self.hosts.load();
        if host.chars().any(char::is_uppercase) {
            return hosts.contains(host.to_lowercase().as_str());
        }
        hosts.contains(host)
    }

    /// Returns true when no host is blocked.
    pub fn is_empty(&self) -> bool {
        self.hosts.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.load().len()
    }

    /// The currently published set.
    pub fn snapshot(&self) -> Arc<FxHashSet<String>> {
        self.hosts.load_full()
    }

    /// Rebuild from the host sources of a configuration.
    ///
    /// A configuration with host filtering disabled publishes an empty set.
    pub fn rebuild_from_config(
        &self,
        config: &Configuration,
        opener: &dyn SourceOpener,
        interrupt: &AtomicBool,
    ) -> Result<RebuildReport, RuleError> {
        if !config.hosts.enabled {
            debug!("host filtering disabled, publishing empty rule set");
            return self.rebuild(&[], opener, interrupt);
        }

        let sources: Vec<RuleSource> = config.hosts.items.iter().map(RuleSource::from).collect();
        self.rebuild(&sources, opener, interrupt)
    }

    /// Scan `sources` in order and publish the resulting set.
    ///
    /// Unreadable sources are reported and skipped. If `interrupt` is raised
    /// the rebuild is abandoned and the previous set stays live.
    pub fn rebuild(
        &self,
        sources: &[RuleSource],
        opener: &dyn SourceOpener,
        interrupt: &AtomicBool,
    ) -> Result<RebuildReport, RuleError> {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        info!(sources = sources.len(), "loading block list");
        let mut next = FxHashSet::with_capacity_and_hasher(self.len(), Default::default());
        let mut errors = Vec::new();

        for source in sources {
            check_interrupt(interrupt)?;
            if source.state == ItemState::Ignore {
                continue;
            }

            match opener.open(source) {
                Ok(None) => apply(&mut next, source.state, source.location.to_lowercase()),
                Ok(Some(reader)) => {
                    if let Err(err) = load_reader(&mut next, source, reader, interrupt) {
                        match err {
                            RuleError::Interrupted => return Err(err),
                            err => {
                                warn!(location = %source.location, error = %err, "skipping rule source");
                                errors.push(err);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(location = %source.location, error = %err, "cannot open rule source");
                    errors.push(RuleError::Source {
                        location: source.location.clone(),
                        source: err,
                    });
                }
            }
        }

        let hosts = next.len();
        self.hosts.store(Arc::new(next));
        info!(hosts, "published block list");

        Ok(RebuildReport { hosts, errors })
    }
}

impl Default for RuleDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn check_interrupt(interrupt: &AtomicBool) -> Result<(), RuleError> {
    if interrupt.load(Ordering::Relaxed) {
        return Err(RuleError::Interrupted);
    }
    Ok(())
}

fn apply(next: &mut FxHashSet<String>, state: ItemState, host: String) {
    match state {
        ItemState::Deny => {
            next.insert(host);
        }
        ItemState::Allow => {
            next.remove(&host);
        }
        ItemState::Ignore => {}
    }
}

fn load_reader(
    next: &mut FxHashSet<String>,
    source: &RuleSource,
    reader: Box<dyn BufRead + Send>,
    interrupt: &AtomicBool,
) -> Result<(), RuleError> {
    debug!(location = %source.location, "reading rule source");
    let mut count = 0usize;

    for line in reader.lines() {
        check_interrupt(interrupt)?;
        let line = line.map_err(|err| RuleError::Source {
            location: source.location.clone(),
            source: err,
        })?;

        if let Some(host) = parse_line(&line) {
            count += 1;
            apply(next, source.state, host);
        }
    }

    debug!(location = %source.location, count, "loaded rule source");
    Ok(())
}

/// A rebuild running on a background thread.
pub struct RebuildTask {
    interrupt: Arc<AtomicBool>,
    handle: thread::JoinHandle<Result<RebuildReport, RuleError>>,
}

impl RebuildTask {
    /// Ask the rebuild to stop at the next line or source boundary.
    pub fn cancel(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the rebuild to complete.
    pub fn join(self) -> Result<RebuildReport, RuleError> {
        self.handle.join().unwrap_or_else(|_| {
            error!("rule database rebuild panicked");
            Err(RuleError::Panicked)
        })
    }
}

/// Rebuild `database` from `sources` on a separate thread.
pub fn spawn_rebuild<O>(database: Arc<RuleDatabase>, sources: Vec<RuleSource>, opener: O) -> RebuildTask
where
    O: SourceOpener + Send + 'static,
{
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    let handle = thread::spawn(move || database.rebuild(&sources, &opener, &flag));

    RebuildTask { interrupt, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::source::tests::MemoryOpener;
    use std::io;

    fn sources(list: &[(&str, ItemState)]) -> Vec<RuleSource> {
        list.iter()
            .map(|(location, state)| RuleSource::new(*location, *state))
            .collect()
    }

    fn rebuild(db: &RuleDatabase, opener: &MemoryOpener, list: &[(&str, ItemState)]) -> RebuildReport {
        db.rebuild(&sources(list), opener, &AtomicBool::new(false)).unwrap()
    }

    #[test]
    fn parse_line_strips_null_prefix_and_comment() {
        assert_eq!(
            parse_line("0.0.0.0 ads.example.com # comment"),
            Some("ads.example.com".to_string())
        );
        assert_eq!(parse_line("127.0.0.1\tTracker.Example.com"), Some("tracker.example.com".to_string()));
        assert_eq!(parse_line("::1 ip6.example.com"), Some("ip6.example.com".to_string()));
    }

    #[test]
    fn parse_line_plain_host() {
        assert_eq!(parse_line("Example.COM"), Some("example.com".to_string()));
        assert_eq!(parse_line("  indented.example.com  "), Some("indented.example.com".to_string()));
    }

    #[test]
    fn parse_line_rejects_comments_and_blanks() {
        assert_eq!(parse_line("   # just a comment"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   \t"), None);
        assert_eq!(parse_line("0.0.0.0"), None);
        assert_eq!(parse_line("0.0.0.0   # nothing"), None);
    }

    #[test]
    fn parse_line_rejects_embedded_whitespace() {
        assert_eq!(parse_line("a b.example.com"), None);
        assert_eq!(parse_line("0.0.0.0 a b.example.com"), None);
    }

    #[test]
    fn parse_line_prefix_needs_separator() {
        // Not a prefix: the address runs into the host.
        assert_eq!(parse_line("0.0.0.0example.com"), Some("0.0.0.0example.com".to_string()));
    }

    #[test]
    fn deny_source_blocks_names() {
        let opener = MemoryOpener::new().with("deny.txt", "0.0.0.0 ads.example.com\ntracker.example.com\n");
        let db = RuleDatabase::new();

        let report = rebuild(&db, &opener, &[("deny.txt", ItemState::Deny)]);

        assert_eq!(report.hosts, 2);
        assert!(db.is_blocked("ads.example.com"));
        assert!(db.is_blocked("tracker.example.com"));
        assert!(!db.is_blocked("example.com"));
    }

    #[test]
    fn lookup_ignores_case() {
        let db = RuleDatabase::new();
        rebuild(&db, &MemoryOpener::new(), &[("ads.example.com", ItemState::Deny)]);

        assert!(db.is_blocked("ADS.Example.com"));
        assert!(db.is_blocked("ads.example.com"));
        assert!(!db.is_blocked("Example.com"));
    }

    #[test]
    fn later_allow_source_unblocks() {
        let opener = MemoryOpener::new()
            .with("deny.txt", "ads.example.com\ncdn.example.com\n")
            .with("allow.txt", "cdn.example.com\n");
        let db = RuleDatabase::new();

        rebuild(&db, &opener, &[("deny.txt", ItemState::Deny), ("allow.txt", ItemState::Allow)]);

        assert!(db.is_blocked("ads.example.com"));
        assert!(!db.is_blocked("cdn.example.com"));
    }

    #[test]
    fn allow_before_deny_does_not_unblock() {
        let opener = MemoryOpener::new()
            .with("deny.txt", "cdn.example.com\n")
            .with("allow.txt", "cdn.example.com\n");
        let db = RuleDatabase::new();

        rebuild(&db, &opener, &[("allow.txt", ItemState::Allow), ("deny.txt", ItemState::Deny)]);

        assert!(db.is_blocked("cdn.example.com"));
    }

    #[test]
    fn ignored_source_is_skipped() {
        let opener = MemoryOpener::new().with("deny.txt", "ads.example.com\n");
        let db = RuleDatabase::new();

        rebuild(&db, &opener, &[("deny.txt", ItemState::Ignore)]);

        assert!(db.is_empty());
    }

    #[test]
    fn literal_location_is_single_host() {
        let opener = MemoryOpener::new();
        let db = RuleDatabase::new();

        rebuild(&db, &opener, &[("Single.Example.com", ItemState::Deny)]);

        assert!(db.is_blocked("single.example.com"));
    }

    #[test]
    fn missing_source_is_reported_and_skipped() {
        let opener = MemoryOpener::new()
            .missing("gone.txt")
            .with("deny.txt", "ads.example.com\n");
        let db = RuleDatabase::new();

        let report = rebuild(&db, &opener, &[("gone.txt", ItemState::Deny), ("deny.txt", ItemState::Deny)]);

        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            &report.errors[0],
            RuleError::Source { location, source } if location == "gone.txt" && source.kind() == io::ErrorKind::NotFound
        ));
        assert!(db.is_blocked("ads.example.com"));
    }

    #[test]
    fn rebuild_is_idempotent() {
        let opener = MemoryOpener::new()
            .with("deny.txt", "a.example.com\nb.example.com\nc.example.com\n")
            .with("allow.txt", "b.example.com\n");
        let list = [("deny.txt", ItemState::Deny), ("allow.txt", ItemState::Allow)];
        let db = RuleDatabase::new();

        rebuild(&db, &opener, &list);
        let first = db.snapshot();
        rebuild(&db, &opener, &list);
        let second = db.snapshot();

        assert_eq!(*first, *second);
    }

    #[test]
    fn rebuild_replaces_previous_set() {
        let opener = MemoryOpener::new()
            .with("one.txt", "one.example.com\n")
            .with("two.txt", "two.example.com\n");
        let db = RuleDatabase::new();

        rebuild(&db, &opener, &[("one.txt", ItemState::Deny)]);
        rebuild(&db, &opener, &[("two.txt", ItemState::Deny)]);

        assert!(!db.is_blocked("one.example.com"));
        assert!(db.is_blocked("two.example.com"));
    }

    #[test]
    fn interrupted_rebuild_keeps_live_set() {
        let opener = MemoryOpener::new()
            .with("one.txt", "one.example.com\n")
            .with("two.txt", "two.example.com\n");
        let db = RuleDatabase::new();
        rebuild(&db, &opener, &[("one.txt", ItemState::Deny)]);

        let result = db.rebuild(&sources(&[("two.txt", ItemState::Deny)]), &opener, &AtomicBool::new(true));

        assert!(matches!(result, Err(RuleError::Interrupted)));
        assert!(db.is_blocked("one.example.com"));
        assert!(!db.is_blocked("two.example.com"));
    }

    #[test]
    fn old_snapshot_stays_readable_after_publish() {
        let opener = MemoryOpener::new()
            .with("one.txt", "one.example.com\n")
            .with("two.txt", "two.example.com\n");
        let db = RuleDatabase::new();
        rebuild(&db, &opener, &[("one.txt", ItemState::Deny)]);

        let held = db.snapshot();
        rebuild(&db, &opener, &[("two.txt", ItemState::Deny)]);

        assert!(held.contains("one.example.com"));
        assert!(!db.is_blocked("one.example.com"));
    }

    #[test]
    fn disabled_hosts_publishes_empty_set() {
        let opener = MemoryOpener::new().with("deny.txt", "ads.example.com\n");
        let db = RuleDatabase::new();
        rebuild(&db, &opener, &[("deny.txt", ItemState::Deny)]);

        let config = Configuration::default();
        db.rebuild_from_config(&config, &opener, &AtomicBool::new(false)).unwrap();

        assert!(db.is_empty());
    }

    #[test]
    fn spawn_rebuild_publishes_from_background_thread() {
        let opener = MemoryOpener::new().with("deny.txt", "ads.example.com\n");
        let db = Arc::new(RuleDatabase::new());

        let task = spawn_rebuild(Arc::clone(&db), sources(&[("deny.txt", ItemState::Deny)]), opener);
        let report = task.join().unwrap();

        assert_eq!(report.hosts, 1);
        assert!(db.is_blocked("ads.example.com"));
    }

    /// Fails while reading its first source.
    struct PanickingOpener;

    impl SourceOpener for PanickingOpener {
        fn open(&self, _source: &RuleSource) -> io::Result<Option<Box<dyn BufRead + Send>>> {
            panic!("opener failure");
        }
    }

    #[test]
    fn panicking_rebuild_is_reported() {
        let db = Arc::new(RuleDatabase::new());

        let task = spawn_rebuild(Arc::clone(&db), sources(&[("deny.txt", ItemState::Deny)]), PanickingOpener);

        assert!(matches!(task.join(), Err(RuleError::Panicked)));
        assert!(db.is_empty());

        // a poisoned writer lock does not stop later rebuilds
        let opener = MemoryOpener::new().with("deny.txt", "ads.example.com\n");
        rebuild(&db, &opener, &[("deny.txt", ItemState::Deny)]);
        assert!(db.is_blocked("ads.example.com"));
    }
}

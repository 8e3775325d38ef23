//! Host name filtering.
//!
//! Provides ad-blocking functionality by checking query names against a
//! database of blocked hosts built from hosts-style lists.

mod rules;
pub(crate) mod source;

pub use rules::{RebuildReport, RebuildTask, RuleDatabase, parse_line, spawn_rebuild};
pub use source::{FsSourceOpener, RuleSource, SourceOpener};

use std::io;

/// Errors from rebuilding the rule database.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The rebuild was cancelled; the previous set stays published.
    #[error("rule database rebuild interrupted")]
    Interrupted,

    /// The rebuild thread panicked; the previous set stays published.
    #[error("rule database rebuild panicked")]
    Panicked,

    /// A single source could not be read.
    #[error("cannot read {location}: {source}")]
    Source {
        location: String,
        #[source]
        source: io::Error,
    },
}

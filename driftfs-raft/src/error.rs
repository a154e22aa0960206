//! Error types exposed by this crate.

use crate::{LogIndex, NodeId, Term};

/// Errors raised by the write-ahead journal.
///
/// Structural errors (unknown record kinds, index jumps, term or vote
/// conflicts, commit regression) abort the operation that raised them and
/// leave the journal in its pre-operation state. During recovery they are
/// wrapped in [`LogError::Corrupt`] with the offending line number.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An entry already exists at this index with an equal or later term.
    #[error("entry exists with index {index} (term: {term})")]
    EntryExists { term: Term, index: LogIndex },

    /// Writing the entry would make the term sequence decrease.
    #[error(
        "addition of entry with index {index} and term {proposed} would cause \
         a decrease in term from {conflicting}"
    )]
    TermConflict {
        proposed: Term,
        conflicting: Term,
        index: LogIndex,
    },

    /// The record carries a term older than the journal's current term.
    #[error("stale term: {proposed}, current: {current}")]
    StaleTerm { proposed: Term, current: Term },

    /// A different vote has already been recorded for this term.
    #[error("vote already exists for term {term}: {current} (requested {requested})")]
    VoteConflict {
        term: Term,
        current: NodeId,
        requested: NodeId,
    },

    /// No entry exists at the given index.
    #[error("no entry with index {0}")]
    EntryMissing(LogIndex),

    /// An entry was appended past the end of the journal.
    #[error("entry index jump: expected {expected}, got {got}")]
    IndexJump { expected: LogIndex, got: LogIndex },

    /// The commit frontier can only move forwards.
    #[error("invalid commit index {proposed}: can't go backwards from {current}")]
    CommitRegression { proposed: LogIndex, current: LogIndex },

    /// A record failed to parse as JSON or carried fields of the wrong type.
    #[error("bad journal record: {0}")]
    BadRecord(#[from] serde_json::Error),

    /// Recovery failed; `line` is 1-based.
    #[error("log error on line {line}: {source}")]
    Corrupt {
        line: u32,
        #[source]
        source: Box<LogError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LogError {
    pub(crate) fn at_line(self, line: u32) -> LogError {
        match self {
            // Already carries its line number; don't wrap it again.
            err @ LogError::Corrupt { .. } => err,
            err => LogError::Corrupt {
                line,
                source: Box::new(err),
            },
        }
    }
}

/// Errors raised while routing an inbound envelope to a module handler.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler for module `{0}`")]
    UnknownModule(String),

    #[error("bad {module} message: {source}")]
    BadContent {
        module: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The journal refused an operation the handler needed; fatal per the
    /// error-handling policy.
    #[error(transparent)]
    Log(#[from] LogError),
}

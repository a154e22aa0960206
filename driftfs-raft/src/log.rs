//! The durable write-ahead journal backing the Raft state machine.
//!
//! The journal is a plain file of newline-delimited JSON records: explicit
//! term advances, votes, replicated entries and commit markers. It is the
//! only durable state a node keeps about consensus; everything else is
//! rebuilt from it on startup.
//!
//! Records are validated before anything is mutated, so a rejected write
//! leaves both the in-memory state and the file untouched. Disk lines are
//! never rewritten: superseding an entry at an existing index appends a new
//! record and the old one is out-voted again on the next recovery.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::{AppData, LogIndex, NodeId, Term};

/// One journal record; one JSON object per line on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", bound = "D: AppData")]
pub enum Record<D: AppData> {
    /// An explicit term advance.
    Term { term: Term },

    /// This node granted its vote to `node` in `term`.
    Vote {
        term: Term,
        #[serde(rename = "for")]
        node: NodeId,
    },

    /// A replicated command. `spawn_term` is the term of the entry
    /// immediately preceding `index` at the time this entry was created,
    /// and is what the log-matching check compares.
    Entry {
        term: Term,
        index: LogIndex,
        spawn_term: Term,
        action: D,
    },

    /// The authoritative commit frontier; monotonically non-decreasing.
    Commit { term: Term, index: LogIndex },
}

/// An entry held in memory, indexed from 1.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry<D: AppData> {
    pub term: Term,
    pub index: LogIndex,
    pub spawn_term: Term,
    pub action: D,
}

/// What an accepted append did beyond storing the record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Set when the record advanced the current term (clearing the vote).
    /// Never set while recovering, so recovery cannot trigger transitions.
    pub term_advanced: Option<Term>,
}

/// Manages the Raft write-ahead log.
#[derive(Debug)]
pub struct Log<D: AppData> {
    file: File,
    term: Term,
    last_vote: Option<NodeId>,
    commit_index: LogIndex,
    entries: Vec<LogEntry<D>>,
}

impl<D: AppData> Log<D> {
    /// Open the journal at `path`, creating it if absent, and recover state
    /// by replaying every record under the same rules as live writes.
    ///
    /// Recovery failures carry the 1-based line number of the bad record.
    pub fn open(path: impl AsRef<Path>) -> Result<Log<D>, LogError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).append(true).create(true).open(path)?;

        tracing::info!("recovering journal from {}", path.display());

        let mut log = Log {
            file,
            term: 0,
            last_vote: None,
            commit_index: 0,
            entries: Vec::new(),
        };

        let reader = BufReader::new(File::open(path)?);
        let mut line_no: u32 = 0;
        for line in reader.lines() {
            let line = line?;
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record<D> =
                serde_json::from_str(&line).map_err(|err| LogError::from(err).at_line(line_no))?;
            log.admit(&record).map_err(|err| err.at_line(line_no))?;
        }

        tracing::info!(
            term = log.term,
            last_vote = ?log.last_vote,
            last_index = log.last_index(),
            commit_index = log.commit_index,
            "recovered journal"
        );
        Ok(log)
    }

    /// The current election term.
    pub fn term(&self) -> Term {
        self.term
    }

    /// The node we voted for in the current term, if any.
    pub fn last_vote(&self) -> Option<&NodeId> {
        self.last_vote.as_ref()
    }

    /// The last known index. Entries number from 1, so 0 means empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// The durable commit frontier.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// The entry at `index`, failing if it does not exist.
    pub fn entry(&self, index: LogIndex) -> Result<&LogEntry<D>, LogError> {
        if index == 0 || index > self.last_index() {
            return Err(LogError::EntryMissing(index));
        }
        Ok(&self.entries[(index - 1) as usize])
    }

    /// The Raft log-matching check: does our entry at `index` carry
    /// `term` as its spawn term?
    pub fn matches(&self, term: Term, index: LogIndex) -> bool {
        // The zeroth index is reserved: no entry, term 0.
        if term == 0 {
            return index == 0;
        }
        tracing::trace!(
            term,
            index,
            last_index = self.last_index(),
            "matching against journal"
        );
        index >= 1
            && index <= self.last_index()
            && self.entries[(index - 1) as usize].spawn_term == term
    }

    /// Drop all entries with indices >= `index`. Logical only: the file
    /// keeps its lines and the superseding entries out-vote them on the
    /// next recovery.
    pub fn invalidate(&mut self, index: LogIndex) -> Result<(), LogError> {
        if index == 0 || index > self.last_index() {
            return Err(LogError::EntryMissing(index));
        }
        self.entries.truncate((index - 1) as usize);
        Ok(())
    }

    /// Append a record: validate, update in-memory state, then write the
    /// line out and flush.
    pub fn append(&mut self, record: Record<D>) -> Result<AppendOutcome, LogError> {
        let outcome = self.admit(&record)?;
        self.persist(&record)?;
        Ok(outcome)
    }

    /// Advance the commit frontier, writing a durable commit marker.
    pub fn set_commit_index(&mut self, index: LogIndex) -> Result<(), LogError> {
        self.append(Record::Commit { term: self.term, index })?;
        Ok(())
    }

    /// Apply a record to in-memory state, validating first so a rejected
    /// record leaves no trace. Shared between live writes and recovery.
    fn admit(&mut self, record: &Record<D>) -> Result<AppendOutcome, LogError> {
        match record {
            Record::Term { term } => self.admit_term(*term),
            Record::Vote { term, node } => self.admit_vote(*term, node),
            Record::Entry {
                term,
                index,
                spawn_term,
                action,
            } => self.admit_entry(*term, *index, *spawn_term, action),
            Record::Commit { term, index } => self.admit_commit(*term, *index),
        }
    }

    /// Term rule: a later term advances the current term and clears the
    /// vote; an older term is rejected.
    fn admit_term(&mut self, term: Term) -> Result<AppendOutcome, LogError> {
        if term < self.term {
            return Err(LogError::StaleTerm {
                proposed: term,
                current: self.term,
            });
        }
        if term > self.term {
            self.term = term;
            self.last_vote = None;
            return Ok(AppendOutcome {
                term_advanced: Some(term),
            });
        }
        Ok(AppendOutcome::default())
    }

    /// Vote rule: at most one vote per term; duplicates are idempotent.
    fn admit_vote(&mut self, term: Term, node: &NodeId) -> Result<AppendOutcome, LogError> {
        if term < self.term {
            return Err(LogError::StaleTerm {
                proposed: term,
                current: self.term,
            });
        }
        // A same-term vote must agree with any existing one. A later term
        // clears the old vote below, so only the equal case can conflict.
        if term == self.term {
            if let Some(current) = &self.last_vote {
                if current != node {
                    return Err(LogError::VoteConflict {
                        term,
                        current: current.clone(),
                        requested: node.clone(),
                    });
                }
            }
        }
        let outcome = self.admit_term(term)?;
        self.last_vote = Some(node.clone());
        Ok(outcome)
    }

    fn admit_entry(
        &mut self,
        term: Term,
        index: LogIndex,
        spawn_term: Term,
        action: &D,
    ) -> Result<AppendOutcome, LogError> {
        let last = self.last_index();
        if index == 0 {
            return Err(LogError::IndexJump {
                expected: last + 1,
                got: 0,
            });
        }

        if term < spawn_term {
            tracing::warn!(
                spawn_term,
                term,
                index,
                "impossible spawn term for log entry"
            );
        }

        if index <= last {
            // Superseding an existing entry needs a strictly later term and
            // must not dip below the preceding entry's term.
            let existing = self.entry(index)?;
            if term <= existing.term {
                return Err(LogError::EntryExists { term, index });
            }
            if index >= 2 {
                let preceding = self.entry(index - 1)?;
                if preceding.term > term {
                    return Err(LogError::TermConflict {
                        proposed: term,
                        conflicting: preceding.term,
                        index,
                    });
                }
            }
            self.entries.truncate((index - 1) as usize);
            self.entries.push(LogEntry {
                term,
                index,
                spawn_term,
                action: action.clone(),
            });
            tracing::info!(index = self.last_index(), "superseded a log entry");

            // Quiet ignore if the term is lower than the current one, but
            // still bump up if it's greater.
            if term > self.term {
                self.term = term;
                self.last_vote = None;
                return Ok(AppendOutcome {
                    term_advanced: Some(term),
                });
            }
            Ok(AppendOutcome::default())
        } else if index == last + 1 {
            let floor = if last == 0 { 0 } else { self.entry(last)?.term };
            if spawn_term < floor {
                return Err(LogError::TermConflict {
                    proposed: spawn_term,
                    conflicting: floor,
                    index,
                });
            }
            // Checked before the push so a stale record leaves no entry.
            if term < self.term {
                return Err(LogError::StaleTerm {
                    proposed: term,
                    current: self.term,
                });
            }
            self.entries.push(LogEntry {
                term,
                index,
                spawn_term,
                action: action.clone(),
            });
            tracing::info!(index = self.last_index(), "added a log entry");
            self.admit_term(term)
        } else {
            Err(LogError::IndexJump {
                expected: last + 1,
                got: index,
            })
        }
    }

    fn admit_commit(&mut self, term: Term, index: LogIndex) -> Result<AppendOutcome, LogError> {
        if term < self.term {
            return Err(LogError::StaleTerm {
                proposed: term,
                current: self.term,
            });
        }
        if index < self.commit_index {
            return Err(LogError::CommitRegression {
                proposed: index,
                current: self.commit_index,
            });
        }
        let outcome = self.admit_term(term)?;
        self.commit_index = index;
        Ok(outcome)
    }

    fn persist(&mut self, record: &Record<D>) -> Result<(), LogError> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        tracing::trace!(%line, "wrote to journal");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    type TestLog = Log<String>;

    fn entry(term: Term, index: LogIndex, spawn_term: Term) -> Record<String> {
        Record::Entry {
            term,
            index,
            spawn_term,
            action: "thud".to_owned(),
        }
    }

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                dir: TempDir::new().expect("temp dir"),
            }
        }

        fn path(&self) -> std::path::PathBuf {
            self.dir.path().join("journal")
        }

        fn write_lines(&self, lines: &[&str]) {
            let mut file = std::fs::File::create(self.path()).expect("create journal");
            for line in lines {
                writeln!(file, "{line}").expect("write line");
            }
        }

        fn open(&self) -> TestLog {
            Log::open(self.path()).expect("open journal")
        }
    }

    #[test]
    fn empty_log_starts_at_zero() {
        let fix = Fixture::new();
        let log = fix.open();

        assert_eq!(log.term(), 0);
        assert_eq!(log.last_vote(), None);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.commit_index(), 0);
    }

    #[test]
    fn recovery_restores_term_vote_and_index() {
        let fix = Fixture::new();
        fix.write_lines(&[
            r#"{"term":1,"type":"vote","for":"endpoint1"}"#,
            r#"{"term":1,"spawn_term":0,"type":"entry","index":1,"action":"thud"}"#,
            r#"{"term":1,"spawn_term":1,"type":"entry","index":2,"action":"thud"}"#,
        ]);

        let log = fix.open();
        assert_eq!(log.term(), 1);
        assert_eq!(log.last_vote(), Some(&"endpoint1".to_owned()));
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn recovery_takes_implicit_term_from_entries() {
        let fix = Fixture::new();
        fix.write_lines(&[
            r#"{"term":1,"type":"entry","spawn_term":0,"index":1,"action":"thud"}"#,
            r#"{"term":2,"type":"entry","spawn_term":1,"index":2,"action":"thud"}"#,
        ]);

        let log = fix.open();
        assert_eq!(log.term(), 2);
        assert_eq!(log.last_vote(), None);
    }

    #[test]
    fn recovery_round_trips_live_writes() {
        let fix = Fixture::new();
        {
            let mut log: TestLog = fix.open();
            log.append(Record::Vote {
                term: 1,
                node: "foo".to_owned(),
            })
            .unwrap();
            log.append(entry(1, 1, 0)).unwrap();
            log.append(entry(1, 2, 1)).unwrap();
            log.set_commit_index(2).unwrap();
        }

        let log = fix.open();
        assert_eq!(log.term(), 1);
        assert_eq!(log.last_vote(), Some(&"foo".to_owned()));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.commit_index(), 2);
        assert_eq!(log.entry(1).unwrap().spawn_term, 0);
        assert_eq!(log.entry(2).unwrap().spawn_term, 1);
    }

    #[test]
    fn later_term_clears_vote() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();
        log.append(Record::Vote {
            term: 1,
            node: "foo".to_owned(),
        })
        .unwrap();

        let outcome = log.append(Record::Term { term: 2 }).unwrap();
        assert_eq!(outcome.term_advanced, Some(2));
        assert_eq!(log.last_vote(), None);
    }

    #[test]
    fn vote_is_unique_per_term() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();
        log.append(Record::Vote {
            term: 1,
            node: "foo".to_owned(),
        })
        .unwrap();

        let err = log
            .append(Record::Vote {
                term: 1,
                node: "bar".to_owned(),
            })
            .unwrap_err();
        assert!(matches!(err, LogError::VoteConflict { .. }));

        // A repeated vote for the same node is idempotent.
        log.append(Record::Vote {
            term: 1,
            node: "foo".to_owned(),
        })
        .unwrap();
        assert_eq!(log.last_vote(), Some(&"foo".to_owned()));
    }

    #[test]
    fn stale_records_are_rejected() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();
        log.append(Record::Term { term: 3 }).unwrap();

        assert!(matches!(
            log.append(Record::Term { term: 2 }),
            Err(LogError::StaleTerm { .. })
        ));
        assert!(matches!(
            log.append(Record::Vote {
                term: 2,
                node: "foo".to_owned()
            }),
            Err(LogError::StaleTerm { .. })
        ));
        assert!(matches!(
            log.append(entry(2, 1, 0)),
            Err(LogError::StaleTerm { .. })
        ));
        // The rejected entry must not have been stored.
        assert_eq!(log.last_index(), 0);
    }

    #[test]
    fn index_jump_is_rejected() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();
        log.append(entry(1, 1, 0)).unwrap();

        let err = log.append(entry(1, 3, 1)).unwrap_err();
        assert!(matches!(err, LogError::IndexJump { expected: 2, got: 3 }));
    }

    #[test]
    fn superseding_entry_invalidates_higher_indices() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();
        log.append(entry(1, 1, 0)).unwrap();
        log.append(entry(1, 2, 1)).unwrap();
        log.append(entry(1, 3, 1)).unwrap();

        // Same index, same term: refused.
        assert!(matches!(
            log.append(entry(1, 2, 1)),
            Err(LogError::EntryExists { .. })
        ));

        // Later term wins and drops everything above.
        log.append(entry(2, 2, 1)).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(2).unwrap().term, 2);
        assert_eq!(log.term(), 2);
    }

    #[test]
    fn supersession_survives_recovery() {
        let fix = Fixture::new();
        {
            let mut log: TestLog = fix.open();
            log.append(entry(1, 1, 0)).unwrap();
            log.append(entry(1, 2, 1)).unwrap();
            log.append(entry(2, 2, 1)).unwrap();
        }

        let log = fix.open();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.entry(2).unwrap().term, 2);
    }

    #[test]
    fn invalidate_then_append_succeeds() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();
        log.append(entry(1, 1, 0)).unwrap();
        log.append(entry(1, 2, 1)).unwrap();
        log.append(entry(1, 3, 1)).unwrap();

        log.invalidate(2).unwrap();
        assert_eq!(log.last_index(), 1);

        log.append(entry(2, 2, 1)).unwrap();
        assert_eq!(log.last_index(), 2);

        assert!(matches!(
            log.invalidate(5),
            Err(LogError::EntryMissing(5))
        ));
    }

    #[test]
    fn matching_follows_spawn_terms() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();

        // The zeroth index is reserved with term 0.
        assert!(log.matches(0, 0));
        assert!(!log.matches(0, 1));
        assert!(!log.matches(1, 0));
        assert!(!log.matches(1, 1));

        log.append(entry(1, 1, 0)).unwrap();
        log.append(entry(1, 2, 1)).unwrap();
        log.append(entry(1, 3, 1)).unwrap();

        // Match idempotence: the freshly appended entry's spawn term names
        // its predecessor.
        assert!(log.matches(log.entry(3).unwrap().spawn_term, 2));
        assert!(log.matches(1, 2));
        assert!(!log.matches(2, 2));
        assert!(!log.matches(1, 9));
    }

    #[test]
    fn commit_index_cannot_regress() {
        let fix = Fixture::new();
        let mut log: TestLog = fix.open();
        log.append(entry(1, 1, 0)).unwrap();
        log.append(entry(1, 2, 1)).unwrap();
        log.set_commit_index(2).unwrap();

        assert!(matches!(
            log.append(Record::Commit { term: 1, index: 1 }),
            Err(LogError::CommitRegression { .. })
        ));
        assert_eq!(log.commit_index(), 2);
    }

    #[test]
    fn recovery_failure_reports_line_number() {
        let fix = Fixture::new();
        fix.write_lines(&[
            r#"{"term":1,"type":"entry","spawn_term":0,"index":1,"action":"thud"}"#,
            r#"{"term":1,"type":"entry","spawn_term":1,"index":3,"action":"thud"}"#,
        ]);

        let err = Log::<String>::open(fix.path()).unwrap_err();
        match err {
            LogError::Corrupt { line, source } => {
                assert_eq!(line, 2);
                assert!(matches!(*source, LogError::IndexJump { .. }));
            }
            other => panic!("expected corrupt error, got {other}"),
        }
    }

    #[test]
    fn recovery_failure_on_unknown_record_kind() {
        let fix = Fixture::new();
        fix.write_lines(&[r#"{"term":1,"type":"frobnicate"}"#]);

        let err = Log::<String>::open(fix.path()).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { line: 1, .. }));
    }
}

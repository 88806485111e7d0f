//! Mutant data model.
//!
//! A mutant is one candidate change to the source tree together with the
//! outcome of running the test suite against it. The model here is
//! language-agnostic: the analysis pass decides what to change, a [`Mutant`]
//! only knows how to apply and revert that change inside a working directory.

mod kind;
mod token;

pub use kind::{MutantType, UnknownMutantType};
pub use token::{ManifestEntry, TokenMutant};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lifecycle state of a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No test exercises the mutated line, never scheduled
    NotCovered,
    /// Waiting to be executed
    Runnable,
    /// Tests passed with the mutation in place
    Lived,
    /// Tests failed with the mutation in place
    Killed,
    /// Verification exceeded its deadline
    TimedOut,
    /// The mutation could not be applied or built
    NotViable,
    /// The engine could not execute the mutant at all
    Errored,
}

impl Status {
    /// True once the executor has classified the mutant.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Runnable)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Only a runnable mutant may change state, and only to a result.
    pub fn can_become(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (
                Status::Runnable,
                Status::Lived
                    | Status::Killed
                    | Status::TimedOut
                    | Status::NotViable
                    | Status::Errored
            )
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::NotCovered => write!(f, "NOT COVERED"),
            Status::Runnable => write!(f, "RUNNABLE"),
            Status::Lived => write!(f, "LIVED"),
            Status::Killed => write!(f, "KILLED"),
            Status::TimedOut => write!(f, "TIMED OUT"),
            Status::NotViable => write!(f, "NOT VIABLE"),
            Status::Errored => write!(f, "ERRORED"),
        }
    }
}

/// Location of the mutated construct, relative to the source root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub file: PathBuf,
    /// 1-indexed
    pub line: usize,
    /// 1-indexed, in characters
    pub column: usize,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Errors raised while applying or reverting a mutation.
#[derive(Debug, Error)]
pub enum MutantError {
    /// The source at the recorded position does not look like the analysis said.
    #[error("cannot apply mutation at {position}: {reason}")]
    NotApplicable { position: Position, reason: String },
    /// Reading or writing the mutated file failed.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file content after rollback differs from what was there before apply.
    #[error("rollback of {0} left content that differs from the original")]
    RollbackMismatch(PathBuf),
    /// `apply` was called without a working directory.
    #[error("no working directory assigned")]
    NoWorkdir,
    /// The implementation panicked during the named step.
    #[error("mutant panicked during {0}")]
    Panicked(&'static str),
}

/// Capabilities the engine needs from a mutant.
///
/// Implementations are moved between tasks, never shared: the producer hands
/// a mutant to exactly one executor, which hands it back on the output channel.
pub trait Mutant: Send + std::fmt::Debug {
    fn mutant_type(&self) -> MutantType;

    fn status(&self) -> Status;

    fn set_status(&mut self, status: Status);

    fn position(&self) -> &Position;

    /// Package directory relative to the source root (`""` for the root itself).
    fn package(&self) -> &str;

    fn workdir(&self) -> Option<&Path>;

    fn set_workdir(&mut self, workdir: PathBuf);

    /// Rewrite the targeted construct inside the assigned working directory.
    fn apply(&mut self) -> Result<(), MutantError>;

    /// Restore the construct. A no-op when nothing was applied.
    fn rollback(&mut self) -> Result<(), MutantError>;
}

pub type BoxedMutant = Box<dyn Mutant>;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [Status; 7] = [
        Status::NotCovered,
        Status::Runnable,
        Status::Lived,
        Status::Killed,
        Status::TimedOut,
        Status::NotViable,
        Status::Errored,
    ];

    #[test]
    fn test_status_display() {
        assert_eq!(Status::NotCovered.to_string(), "NOT COVERED");
        assert_eq!(Status::Runnable.to_string(), "RUNNABLE");
        assert_eq!(Status::Lived.to_string(), "LIVED");
        assert_eq!(Status::Killed.to_string(), "KILLED");
        assert_eq!(Status::TimedOut.to_string(), "TIMED OUT");
        assert_eq!(Status::NotViable.to_string(), "NOT VIABLE");
        assert_eq!(Status::Errored.to_string(), "ERRORED");
    }

    #[test]
    fn test_runnable_moves_only_to_results() {
        for next in ALL_STATUSES {
            let expected = !matches!(next, Status::Runnable | Status::NotCovered);
            assert_eq!(
                Status::Runnable.can_become(next),
                expected,
                "runnable -> {}",
                next
            );
        }
    }

    #[test]
    fn test_terminal_statuses_never_move() {
        for from in ALL_STATUSES {
            if from == Status::Runnable {
                continue;
            }
            assert!(from.is_terminal());
            for next in ALL_STATUSES {
                assert!(!from.can_become(next), "{} -> {}", from, next);
            }
        }
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&Status::TimedOut).unwrap(),
            "\"timed_out\""
        );
        assert_eq!(
            serde_json::to_string(&Status::NotViable).unwrap(),
            "\"not_viable\""
        );
    }

    #[test]
    fn test_position_display() {
        let pos = Position {
            file: PathBuf::from("src/lib.rs"),
            line: 12,
            column: 7,
        };
        assert_eq!(pos.to_string(), "src/lib.rs:12:7");
    }
}

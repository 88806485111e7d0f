//! Text-replacement mutants.
//!
//! The analysis pass reports a token (`>`, `+`, `&&`, ...) at a line and
//! column together with its replacement. Applying swaps exactly that token in
//! the working-directory copy; rolling back writes the original bytes back and
//! checks them against a digest taken before the change.

use super::{Mutant, MutantError, MutantType, Position, Status};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Compute a SHA256 hash of the content
fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// What is needed to undo an applied mutation.
#[derive(Debug)]
struct Applied {
    path: PathBuf,
    original: String,
    digest: String,
}

type WriteFn = fn(&Path, &str) -> std::io::Result<()>;

fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)
}

/// A mutant that replaces one token at a fixed source position.
#[derive(Debug)]
pub struct TokenMutant {
    mutant_type: MutantType,
    status: Status,
    position: Position,
    package: String,
    original: String,
    replacement: String,
    workdir: Option<PathBuf>,
    applied: Option<Applied>,
    writer: WriteFn,
}

impl TokenMutant {
    pub fn new(
        mutant_type: MutantType,
        position: Position,
        package: impl Into<String>,
        original: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            mutant_type,
            status: Status::Runnable,
            position,
            package: package.into(),
            original: original.into(),
            replacement: replacement.into(),
            workdir: None,
            applied: None,
            writer: write_file,
        }
    }

    fn not_applicable(&self, reason: impl Into<String>) -> MutantError {
        MutantError::NotApplicable {
            position: self.position.clone(),
            reason: reason.into(),
        }
    }

    /// Byte offset of `line:column` within `content`.
    fn locate(&self, content: &str) -> Result<usize, MutantError> {
        let line_count = content.split_inclusive('\n').count();
        if self.position.line == 0 || self.position.line > line_count {
            return Err(self.not_applicable(format!(
                "line {} out of range (file has {} lines)",
                self.position.line, line_count
            )));
        }

        let line_start: usize = content
            .split_inclusive('\n')
            .take(self.position.line - 1)
            .map(str::len)
            .sum();
        let line = content[line_start..]
            .split_inclusive('\n')
            .next()
            .unwrap_or_default();
        let line = line.trim_end_matches(['\n', '\r']);

        if self.position.column == 0 {
            return Err(self.not_applicable("column 0 is not a valid position"));
        }
        let column_offset = if self.position.column == line.chars().count() + 1 {
            line.len()
        } else {
            line.char_indices()
                .nth(self.position.column - 1)
                .map(|(idx, _)| idx)
                .ok_or_else(|| {
                    self.not_applicable(format!(
                        "column {} out of range (line has {} characters)",
                        self.position.column,
                        line.chars().count()
                    ))
                })?
        };

        Ok(line_start + column_offset)
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), MutantError> {
        (self.writer)(path, content).map_err(|source| MutantError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Mutant for TokenMutant {
    fn mutant_type(&self) -> MutantType {
        self.mutant_type
    }

    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    fn position(&self) -> &Position {
        &self.position
    }

    fn package(&self) -> &str {
        &self.package
    }

    fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    fn set_workdir(&mut self, workdir: PathBuf) {
        self.workdir = Some(workdir);
    }

    fn apply(&mut self) -> Result<(), MutantError> {
        if self.applied.is_some() {
            return Err(self.not_applicable("mutation is already applied"));
        }
        if self.original.is_empty() {
            return Err(self.not_applicable("empty original token"));
        }
        let workdir = self.workdir.as_ref().ok_or(MutantError::NoWorkdir)?;
        let path = workdir.join(&self.position.file);

        let content = std::fs::read_to_string(&path).map_err(|source| MutantError::Io {
            path: path.clone(),
            source,
        })?;

        let offset = self.locate(&content)?;
        if !content[offset..].starts_with(&self.original) {
            let found: String = content[offset..]
                .chars()
                .take(self.original.chars().count())
                .collect();
            return Err(self.not_applicable(format!(
                "expected '{}', found '{}'",
                self.original, found
            )));
        }

        let mut mutated = String::with_capacity(content.len() + self.replacement.len());
        mutated.push_str(&content[..offset]);
        mutated.push_str(&self.replacement);
        mutated.push_str(&content[offset + self.original.len()..]);

        // Recorded first so a partial write can still be rolled back.
        let applied = Applied {
            digest: compute_hash(content.as_bytes()),
            path,
            original: content,
        };
        let path = applied.path.clone();
        self.applied = Some(applied);
        self.write(&path, &mutated)
    }

    fn rollback(&mut self) -> Result<(), MutantError> {
        let Some(applied) = self.applied.as_ref() else {
            return Ok(());
        };

        if let Err(e) = self.write(&applied.path, &applied.original) {
            tracing::warn!("Retrying revert of {}: {}", applied.path.display(), e);
            self.write(&applied.path, &applied.original)?;
        }

        let restored = std::fs::read(&applied.path).map_err(|source| MutantError::Io {
            path: applied.path.clone(),
            source,
        })?;
        if compute_hash(&restored) != applied.digest {
            return Err(MutantError::RollbackMismatch(applied.path.clone()));
        }

        self.applied = None;
        Ok(())
    }
}

/// One entry of the JSON mutant manifest written by the analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub mutant_type: MutantType,
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    #[serde(default)]
    pub package: String,
    pub original: String,
    pub replacement: String,
    /// Whether any test exercises this line
    #[serde(default = "default_covered")]
    pub covered: bool,
}

fn default_covered() -> bool {
    true
}

impl ManifestEntry {
    pub fn into_mutant(self) -> TokenMutant {
        let covered = self.covered;
        let mut mutant = TokenMutant::new(
            self.mutant_type,
            Position {
                file: self.file,
                line: self.line,
                column: self.column,
            },
            self.package,
            self.original,
            self.replacement,
        );
        if !covered {
            mutant.set_status(Status::NotCovered);
        }
        mutant
    }

    /// Parse a manifest file (a JSON array of entries).
    pub fn load(path: &Path) -> anyhow::Result<Vec<ManifestEntry>> {
        use anyhow::Context;

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read mutant manifest {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse mutant manifest {:?}", path))
    }
}

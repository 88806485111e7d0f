//! Test doubles shared by the executor, pool and engine tests.

use crate::mutant::{Mutant, MutantError, MutantType, Position, Status};
use crate::verify::{Verdict, Verifier};
use crate::workdir::{ProvisionError, Provisioner, Reclaim, Workdir};
use crate::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// In-memory mutant that records apply/rollback calls.
#[derive(Debug)]
pub struct StubMutant {
    pub position: Position,
    pub package: String,
    pub status: Status,
    pub mutant_type: MutantType,
    pub workdir: Option<PathBuf>,
    pub apply_called: bool,
    pub rollback_called: bool,
    pub apply_fails: bool,
    pub rollback_fails: bool,
    pub apply_panics: bool,
    pub rollback_panics: bool,
}

impl StubMutant {
    pub fn new(id: usize) -> Self {
        Self {
            position: Position {
                file: PathBuf::from("stub.rs"),
                line: id,
                column: 1,
            },
            package: String::new(),
            status: Status::Runnable,
            mutant_type: MutantType::ArithmeticBase,
            workdir: None,
            apply_called: false,
            rollback_called: false,
            apply_fails: false,
            rollback_fails: false,
            apply_panics: false,
            rollback_panics: false,
        }
    }

    pub fn boxed(id: usize) -> Box<dyn Mutant> {
        Box::new(Self::new(id))
    }
}

impl Mutant for StubMutant {
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
        self.apply_called = true;
        if self.apply_panics {
            panic!("stub mutant crashed while applying");
        }
        if self.apply_fails {
            return Err(MutantError::NotApplicable {
                position: self.position.clone(),
                reason: "test error".to_string(),
            });
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), MutantError> {
        self.rollback_called = true;
        if self.rollback_panics {
            panic!("stub mutant crashed while rolling back");
        }
        if self.rollback_fails {
            return Err(MutantError::RollbackMismatch(PathBuf::from("stub.rs")));
        }
        Ok(())
    }
}

/// Hands out one shared temporary directory and counts calls.
pub struct StubProvisioner {
    pub dir: TempDir,
    pub fail: bool,
    pub panic: bool,
    pub acquired: AtomicUsize,
    pub reclaimed: Mutex<Vec<Reclaim>>,
    pub released: AtomicUsize,
}

impl StubProvisioner {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            fail: false,
            panic: false,
            acquired: AtomicUsize::new(0),
            reclaimed: Mutex::new(Vec::new()),
            released: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Self::new()
        }
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(relative)).unwrap()
    }
}

impl Provisioner for StubProvisioner {
    fn acquire<'a>(&'a self, package: &'a str) -> BoxFuture<'a, Result<Workdir, ProvisionError>> {
        Box::pin(async move {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("stub provisioner crashed");
            }
            if self.fail {
                return Err(ProvisionError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                )));
            }
            Ok(Workdir {
                root: self.dir.path().to_path_buf(),
                package_dir: self.dir.path().join(package),
            })
        })
    }

    fn reclaim(&self, _workdir: Workdir, reclaim: Reclaim) {
        self.reclaimed.lock().unwrap().push(reclaim);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub enum StubBehavior {
    Pass,
    Fail,
    /// Sleep, honoring the deadline like a real command would.
    Sleep(Duration),
    BuildFail,
    Panic,
}

/// Verifier that records what it saw in the working directory.
pub struct StubVerifier {
    pub behavior: StubBehavior,
    pub watch: Option<String>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

impl StubVerifier {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            watch: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Record the content of `relative` (under the root) on every call.
    pub fn watching(mut self, relative: &str) -> Self {
        self.watch = Some(relative.to_string());
        self
    }
}

impl Verifier for StubVerifier {
    fn verify<'a>(&'a self, dir: &'a Path, timeout: Duration) -> BoxFuture<'a, Verdict> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(relative) = &self.watch {
                if let Ok(content) = std::fs::read_to_string(dir.join(relative)) {
                    self.seen.lock().unwrap().push(content);
                }
            }
            match &self.behavior {
                StubBehavior::Pass => Verdict::Passed,
                StubBehavior::Fail => Verdict::Failed { exit_code: Some(1) },
                StubBehavior::BuildFail => Verdict::BuildFailed {
                    output: "error: does not compile".to_string(),
                },
                StubBehavior::Sleep(duration) => {
                    match tokio::time::timeout(timeout, tokio::time::sleep(*duration)).await {
                        Ok(()) => Verdict::Passed,
                        Err(_) => Verdict::TimedOut,
                    }
                }
                StubBehavior::Panic => panic!("verifier crashed"),
            }
        })
    }
}

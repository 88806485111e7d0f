//! Working-directory provisioning.
//!
//! Every executor mutates its own copy of the source tree. Copies are made
//! lazily, handed out to one executor at a time, pooled once the mutation has
//! been rolled back, and deleted when the run is released.

use crate::BoxFuture;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;
use thiserror::Error;

/// An isolated copy of the source tree held by one executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workdir {
    /// Root of the copy; mutant positions are relative to it.
    pub root: PathBuf,
    /// Directory the verification command runs in.
    pub package_dir: PathBuf,
}

/// What to do with a working directory handed back to the provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// The copy is clean and may serve another mutant.
    Reuse,
    /// The copy may be dirty; delete it.
    Discard,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to create working directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to copy {from} into working directory: {message}")]
    Copy { from: PathBuf, message: String },
    #[error("package {0:?} is not a directory inside the source tree")]
    MissingPackage(String),
    #[error("working directories have already been released")]
    Released,
}

/// Supplies working directories to executors.
pub trait Provisioner: Send + Sync {
    /// Hand out a directory ready for building and testing `package`.
    ///
    /// Two calls never return the same root while both are live.
    fn acquire<'a>(&'a self, package: &'a str) -> BoxFuture<'a, Result<Workdir, ProvisionError>>;

    /// Take back a directory after its mutation was rolled back.
    fn reclaim(&self, workdir: Workdir, reclaim: Reclaim);

    /// Delete everything provisioned so far. Safe to call more than once.
    fn release(&self);
}

#[derive(Default)]
struct PoolState {
    copies: HashMap<PathBuf, TempDir>,
    idle: Vec<PathBuf>,
    released: bool,
}

/// Provisioner that copies the source root into temporary directories.
pub struct CopyProvisioner {
    source_root: PathBuf,
    skip: Vec<String>,
    prefix: String,
    state: Mutex<PoolState>,
}

impl CopyProvisioner {
    /// `skip` holds glob patterns matched against top-level entry names.
    pub fn new(source_root: impl Into<PathBuf>, skip: Vec<String>, prefix: impl Into<String>) -> Self {
        Self {
            source_root: source_root.into(),
            skip,
            prefix: prefix.into(),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Number of copies currently on disk.
    pub fn live_count(&self) -> usize {
        self.lock().copies.len()
    }

    /// Number of copies waiting to be reused.
    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_package(&self, package: &str) -> Result<(), ProvisionError> {
        let relative = Path::new(package);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || !self.source_root.join(relative).is_dir() {
            return Err(ProvisionError::MissingPackage(package.to_string()));
        }
        Ok(())
    }

    async fn acquire_inner(&self, package: &str) -> Result<Workdir, ProvisionError> {
        self.check_package(package)?;

        let reused = {
            let mut state = self.lock();
            if state.released {
                return Err(ProvisionError::Released);
            }
            state.idle.pop()
        };

        let root = match reused {
            Some(root) => {
                tracing::debug!("Reusing working directory {}", root.display());
                root
            }
            None => {
                let temp_dir = copy_source_to_temp(&self.source_root, &self.skip, &self.prefix).await?;
                let root = temp_dir.path().to_path_buf();

                let mut state = self.lock();
                if state.released {
                    drop(state);
                    close_quietly(temp_dir);
                    return Err(ProvisionError::Released);
                }
                state.copies.insert(root.clone(), temp_dir);
                tracing::debug!("Provisioned working directory {}", root.display());
                root
            }
        };

        Ok(Workdir {
            package_dir: root.join(package),
            root,
        })
    }
}

impl Provisioner for CopyProvisioner {
    fn acquire<'a>(&'a self, package: &'a str) -> BoxFuture<'a, Result<Workdir, ProvisionError>> {
        Box::pin(self.acquire_inner(package))
    }

    fn reclaim(&self, workdir: Workdir, reclaim: Reclaim) {
        let discarded = {
            let mut state = self.lock();
            if !state.copies.contains_key(&workdir.root) {
                return;
            }
            match reclaim {
                Reclaim::Reuse if !state.released => {
                    state.idle.push(workdir.root);
                    None
                }
                _ => state.copies.remove(&workdir.root),
            }
        };

        if let Some(temp_dir) = discarded {
            tracing::debug!("Discarding working directory {}", temp_dir.path().display());
            close_quietly(temp_dir);
        }
    }

    fn release(&self) {
        let copies = {
            let mut state = self.lock();
            state.released = true;
            state.idle.clear();
            std::mem::take(&mut state.copies)
        };

        if !copies.is_empty() {
            tracing::debug!("Releasing {} working directories", copies.len());
        }
        for (_, temp_dir) in copies {
            close_quietly(temp_dir);
        }
    }
}

impl Drop for CopyProvisioner {
    fn drop(&mut self) {
        self.release();
    }
}

fn close_quietly(temp_dir: TempDir) {
    let path = temp_dir.path().to_path_buf();
    if let Err(e) = temp_dir.close() {
        tracing::warn!("Failed to remove working directory {}: {}", path.display(), e);
    }
}

/// Copy the source tree into a fresh temporary directory.
async fn copy_source_to_temp(
    source_root: &Path,
    skip: &[String],
    prefix: &str,
) -> Result<TempDir, ProvisionError> {
    let source_root = source_root.to_path_buf();
    let skip = skip.to_vec();
    let prefix = prefix.to_string();

    // fs_extra is synchronous
    tokio::task::spawn_blocking(move || -> Result<TempDir, ProvisionError> {
        let temp_dir = TempDir::with_prefix(&prefix)?;

        let mut items = Vec::new();
        for entry in std::fs::read_dir(&source_root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if skip.iter().any(|pattern| glob_match::glob_match(pattern, &name)) {
                continue;
            }
            items.push(entry.path());
        }

        let options = fs_extra::dir::CopyOptions {
            overwrite: false,
            skip_exist: false,
            buffer_size: 64 * 1024, // 64KB buffer
            copy_inside: false,
            content_only: false,
            depth: 0, // Unlimited depth
        };

        fs_extra::copy_items(&items, temp_dir.path(), &options).map_err(|e| {
            ProvisionError::Copy {
                from: source_root.clone(),
                message: e.to_string(),
            }
        })?;

        Ok(temp_dir)
    })
    .await
    .map_err(|e| ProvisionError::Copy {
        from: PathBuf::new(),
        message: format!("copy task failed: {}", e),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn source_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("pkg/inner")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("target/debug")).unwrap();
        std::fs::write(root.join("Cargo.toml"), "[package]").unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(root.join("pkg/inner/mod.rs"), "// inner").unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(root.join("target/debug/out"), "bin").unwrap();
        dir
    }

    fn provisioner(source: &TempDir) -> CopyProvisioner {
        CopyProvisioner::new(
            source.path(),
            vec![".git".to_string(), "target".to_string()],
            "mutiny-test-",
        )
    }

    #[tokio::test]
    async fn test_acquire_copies_tree_and_skips_patterns() {
        let source = source_tree();
        let provisioner = provisioner(&source);

        let workdir = provisioner.acquire("").await.unwrap();
        assert_ne!(workdir.root, source.path());
        assert_eq!(
            std::fs::read_to_string(workdir.root.join("src/lib.rs")).unwrap(),
            "pub fn f() {}"
        );
        assert!(workdir.root.join("pkg/inner/mod.rs").exists());
        assert!(!workdir.root.join(".git").exists());
        assert!(!workdir.root.join("target").exists());
    }

    #[tokio::test]
    async fn test_acquire_resolves_package_dir() {
        let source = source_tree();
        let provisioner = provisioner(&source);

        let workdir = provisioner.acquire("pkg/inner").await.unwrap();
        assert_eq!(workdir.package_dir, workdir.root.join("pkg/inner"));
        assert!(workdir.package_dir.is_dir());
    }

    #[tokio::test]
    async fn test_acquire_missing_package() {
        let source = source_tree();
        let provisioner = provisioner(&source);

        assert!(matches!(
            provisioner.acquire("nope").await,
            Err(ProvisionError::MissingPackage(_))
        ));
        assert!(matches!(
            provisioner.acquire("../elsewhere").await,
            Err(ProvisionError::MissingPackage(_))
        ));
        assert_eq!(provisioner.live_count(), 0);
    }

    #[tokio::test]
    async fn test_live_workdirs_never_overlap() {
        let source = source_tree();
        let provisioner = Arc::new(provisioner(&source));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let provisioner = Arc::clone(&provisioner);
            handles.push(tokio::spawn(async move {
                provisioner.acquire("").await.unwrap()
            }));
        }

        let mut roots = HashSet::new();
        for handle in handles {
            roots.insert(handle.await.unwrap().root);
        }
        assert_eq!(roots.len(), 6);
        assert_eq!(provisioner.live_count(), 6);
    }

    #[tokio::test]
    async fn test_reclaimed_workdir_is_reused() {
        let source = source_tree();
        let provisioner = provisioner(&source);

        let first = provisioner.acquire("").await.unwrap();
        let root = first.root.clone();
        provisioner.reclaim(first, Reclaim::Reuse);
        assert_eq!(provisioner.idle_count(), 1);

        let second = provisioner.acquire("src").await.unwrap();
        assert_eq!(second.root, root);
        assert_eq!(second.package_dir, root.join("src"));
        assert_eq!(provisioner.live_count(), 1);
        assert_eq!(provisioner.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_discarded_workdir_is_deleted() {
        let source = source_tree();
        let provisioner = provisioner(&source);

        let workdir = provisioner.acquire("").await.unwrap();
        let root = workdir.root.clone();
        provisioner.reclaim(workdir, Reclaim::Discard);

        assert!(!root.exists());
        assert_eq!(provisioner.live_count(), 0);

        let next = provisioner.acquire("").await.unwrap();
        assert_ne!(next.root, root);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let source = source_tree();
        let provisioner = provisioner(&source);

        let a = provisioner.acquire("").await.unwrap();
        let b = provisioner.acquire("").await.unwrap();
        provisioner.reclaim(b.clone(), Reclaim::Reuse);

        provisioner.release();
        assert!(!a.root.exists());
        assert!(!b.root.exists());
        assert_eq!(provisioner.live_count(), 0);

        provisioner.release();
        assert_eq!(provisioner.live_count(), 0);

        // Late reclaim after release is ignored
        provisioner.reclaim(a, Reclaim::Reuse);
        assert_eq!(provisioner.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_release_without_acquire() {
        let source = source_tree();
        let provisioner = provisioner(&source);
        provisioner.release();
        provisioner.release();
    }

    #[tokio::test]
    async fn test_acquire_after_release_fails() {
        let source = source_tree();
        let provisioner = provisioner(&source);
        provisioner.release();

        assert!(matches!(
            provisioner.acquire("").await,
            Err(ProvisionError::Released)
        ));
    }

    #[tokio::test]
    async fn test_source_is_untouched_by_mutating_copy() {
        let source = source_tree();
        let provisioner = provisioner(&source);

        let workdir = provisioner.acquire("").await.unwrap();
        std::fs::write(workdir.root.join("src/lib.rs"), "mutated").unwrap();

        assert_eq!(
            std::fs::read_to_string(source.path().join("src/lib.rs")).unwrap(),
            "pub fn f() {}"
        );
    }
}

//! Content fingerprinting: turns a task's command, environment, declared
//! inputs and upstream dependency fingerprints into the single hex digest
//! the cache keys on.
//!
//! File hashes are memoized by `(path, mtime_ns, size)` so that a build
//! graph with the same inputs touched by several tasks only reads each
//! file once per run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::error::ZrError;
use crate::platform::Platform;

/// Memoization key for a single input file's content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileStat {
    path: PathBuf,
    mtime_ns: i128,
    size: u64,
}

/// Computes and memoizes task fingerprints for one invocation.
///
/// Not `Clone`: callers share one instance behind an `Arc` so the file
/// hash cache is actually shared across concurrently fingerprinting tasks.
#[derive(Debug)]
pub struct Fingerprinter {
    platform_tag: String,
    file_hashes: Mutex<HashMap<FileStat, String>>,
}

impl Fingerprinter {
    /// Build a fingerprinter tagged with the current platform.
    #[must_use]
    pub fn new() -> Self {
        Self::with_platform(Platform::detect())
    }

    /// Build a fingerprinter tagged with an explicit platform (for tests
    /// that need deterministic, platform-independent fingerprints).
    #[must_use]
    pub fn with_platform(platform: Platform) -> Self {
        Self {
            platform_tag: platform.tag(),
            file_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the fingerprint for one task invocation.
    ///
    /// `inputs` are the task's resolved (globbed) input file paths, sorted
    /// by the caller so fingerprint order never depends on filesystem
    /// iteration order. `dep_fingerprints` are the already-computed
    /// fingerprints of this task's direct dependencies, in dependency-name
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::InputMissing`] if a declared input cannot be
    /// `stat`'d, and [`ZrError::Internal`] if it exists but cannot be read.
    pub fn fingerprint(
        &self,
        task_name: &str,
        cmd: &str,
        env: &[(&str, &str)],
        cwd: Option<&Path>,
        inputs: &[PathBuf],
        dep_fingerprints: &[&str],
    ) -> Result<String, ZrError> {
        let mut hasher = Sha256::new();
        hasher.update(b"zr-fingerprint-v1\0");
        hasher.update(self.platform_tag.as_bytes());
        hasher.update(b"\0cmd\0");
        hasher.update(cmd.as_bytes());
        if let Some(cwd) = cwd {
            hasher.update(b"\0cwd\0");
            hasher.update(cwd.to_string_lossy().as_bytes());
        }

        let mut sorted_env: Vec<(&str, &str)> = env.to_vec();
        sorted_env.sort_unstable_by_key(|(k, _)| *k);
        for (k, v) in sorted_env {
            hasher.update(b"\0env\0");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }

        let mut sorted_inputs = inputs.to_vec();
        sorted_inputs.sort_unstable();
        for path in &sorted_inputs {
            let file_hash = self.hash_file(task_name, path)?;
            hasher.update(b"\0input\0");
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(b"=");
            hasher.update(file_hash.as_bytes());
        }

        let mut sorted_deps = dep_fingerprints.to_vec();
        sorted_deps.sort_unstable();
        for dep_fp in sorted_deps {
            hasher.update(b"\0dep\0");
            hasher.update(dep_fp.as_bytes());
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Hash one input file's content, reusing a cached digest when the
    /// file's `(mtime, size)` hasn't changed since it was last observed.
    fn hash_file(&self, task_name: &str, path: &Path) -> Result<String, ZrError> {
        let meta = std::fs::metadata(path).map_err(|_| ZrError::InputMissing {
            task: task_name.to_string(),
            path: path.to_path_buf(),
        })?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as i128);
        let stat = FileStat {
            path: path.to_path_buf(),
            mtime_ns,
            size: meta.len(),
        };

        if let Some(cached) = self.file_hashes.lock().unwrap_or_else(|e| e.into_inner()).get(&stat) {
            return Ok(cached.clone());
        }

        let content = std::fs::read(path).map_err(|source| {
            ZrError::Internal(format!("reading input {}: {source}", path.display()))
        })?;
        let digest = hex::encode(Sha256::digest(&content));

        self.file_hashes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stat, digest.clone());
        Ok(digest)
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

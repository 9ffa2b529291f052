//! Content-addressed result cache.
//!
//! Layout on disk, keyed by a task's fingerprint `fp`:
//!
//! ```text
//! <root>/<fp[0..2]>/<fp[2..]>/manifest.json
//! <root>/<fp[0..2]>/<fp[2..]>/blobs/<sha256-of-output-file>
//! <root>/<fp[0..2]>/<fp[2..]>/.lock
//! ```
//!
//! Two-level hash-prefix sharding keeps any one directory from holding
//! more entries than common filesystems handle comfortably. An advisory
//! lock file per entry gives at-most-one-concurrent-writer semantics: a
//! second task racing on the same fingerprint either waits for the first
//! writer or (after a bounded number of jittered retries) falls back to
//! running uncached rather than stalling forever.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ZrError;

/// Starting backoff delay, in milliseconds, between `begin_write`
/// contention retries.
const BACKOFF_START_MS: u64 = 10;
/// Ceiling on the backoff delay, in milliseconds, reached after repeated
/// contention.
const BACKOFF_MAX_MS: u64 = 1000;

/// One output file recorded in a cache entry's manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedOutput {
    /// Path the task declared this output at, relative to its working
    /// directory.
    pub path: String,
    /// Content hash of the output, also the blob's file name.
    pub sha256: String,
}

/// Metadata persisted alongside a cache entry's blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Fingerprint this entry was stored under.
    pub fingerprint: String,
    /// Task name that produced this entry (diagnostic only; entries are
    /// addressed purely by fingerprint).
    pub task: String,
    /// When this entry was committed.
    pub created_at: DateTime<Utc>,
    /// Captured standard output, truncated per the process controller's
    /// capture limit.
    pub stdout: String,
    /// Captured standard error, truncated per the process controller's
    /// capture limit.
    pub stderr: String,
    /// Output files captured at commit time.
    pub outputs: Vec<CachedOutput>,
}

/// Outcome of [`CacheStore::lookup`].
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// No entry exists for this fingerprint.
    Miss,
    /// A complete entry exists and was read.
    Hit(CacheManifest),
}

/// A held write lock on one cache entry, returned by
/// [`CacheStore::begin_write`]. Dropping without calling [`Self::commit`]
/// releases the lock and leaves no entry behind.
#[derive(Debug)]
pub struct WriteHandle {
    entry_dir: PathBuf,
    fingerprint: String,
    _lock_file: File,
}

impl WriteHandle {
    /// Commit `manifest` and its output blobs, replacing any previous
    /// (necessarily invalid, since we hold the write lock) contents of
    /// this entry atomically: write to a temp path beside the entry, then
    /// rename over it.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::CacheIoError`] if the temp files cannot be
    /// written, hashed, or renamed into place.
    pub fn commit(
        self,
        mut manifest: CacheManifest,
        output_files: &[(String, PathBuf)],
    ) -> Result<(), ZrError> {
        let blobs_dir = self.entry_dir.join("blobs");
        fs::create_dir_all(&blobs_dir)
            .map_err(|e| ZrError::CacheIoError(format!("creating {}: {e}", blobs_dir.display())))?;

        let mut outputs = Vec::with_capacity(output_files.len());
        for (logical_path, src) in output_files {
            let content = fs::read(src)
                .map_err(|e| ZrError::CacheIoError(format!("reading output {}: {e}", src.display())))?;
            let digest = hex::encode(Sha256::digest(&content));
            let dest = blobs_dir.join(&digest);
            if !dest.exists() {
                atomic_write(&dest, &content)?;
            }
            outputs.push(CachedOutput { path: logical_path.clone(), sha256: digest });
        }
        manifest.outputs = outputs;

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ZrError::CacheIoError(format!("serializing manifest: {e}")))?;
        atomic_write(&self.entry_dir.join("manifest.json"), &manifest_json)?;
        Ok(())
    }

    /// Fingerprint this handle was opened for.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn atomic_write(dest: &Path, content: &[u8]) -> Result<(), ZrError> {
    let Some(parent) = dest.parent() else {
        return Err(ZrError::CacheIoError(format!("{} has no parent directory", dest.display())));
    };
    let tmp_name = format!(".tmp-{}", uuid::Uuid::new_v4());
    let tmp_path = parent.join(tmp_name);

    let mut tmp = File::create(&tmp_path)
        .map_err(|e| ZrError::CacheIoError(format!("creating {}: {e}", tmp_path.display())))?;
    tmp.write_all(content)
        .map_err(|e| ZrError::CacheIoError(format!("writing {}: {e}", tmp_path.display())))?;
    tmp.sync_all()
        .map_err(|e| ZrError::CacheIoError(format!("syncing {}: {e}", tmp_path.display())))?;
    drop(tmp);

    fs::rename(&tmp_path, dest).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        ZrError::CacheIoError(format!("renaming {} to {}: {e}", tmp_path.display(), dest.display()))
    })?;

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Aggregate counters for `zr cache` reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of complete entries on disk.
    pub entry_count: usize,
    /// Total bytes occupied by blobs and manifests.
    pub total_bytes: u64,
}

/// Content-addressed cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open a cache store rooted at `root`, sweeping any leftover `.tmp-*`
    /// files from a prior run that was killed mid-commit.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::CacheIoError`] if `root` exists but cannot be
    /// walked.
    pub fn open(root: PathBuf) -> Result<Self, ZrError> {
        let store = Self { root };
        store.sweep_leftover_temp_files()?;
        Ok(store)
    }

    fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        let (prefix, rest) = fingerprint.split_at(fingerprint.len().min(2));
        self.root.join(prefix).join(rest)
    }

    fn sweep_leftover_temp_files(&self) -> Result<(), ZrError> {
        if !self.root.exists() {
            return Ok(());
        }
        for shard in walk_dirs(&self.root)? {
            for entry in walk_dirs(&shard)? {
                remove_matching(&entry, |name| name.starts_with(".tmp-"))?;
                let blobs = entry.join("blobs");
                if blobs.exists() {
                    remove_matching(&blobs, |name| name.starts_with(".tmp-"))?;
                }
            }
        }
        Ok(())
    }

    /// Look up a complete entry for `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::CacheIoError`] if a manifest exists but cannot
    /// be read or parsed.
    pub fn lookup(&self, fingerprint: &str) -> Result<CacheLookup, ZrError> {
        let manifest_path = self.entry_dir(fingerprint).join("manifest.json");
        if !manifest_path.exists() {
            return Ok(CacheLookup::Miss);
        }
        let content = fs::read(&manifest_path)
            .map_err(|e| ZrError::CacheIoError(format!("reading {}: {e}", manifest_path.display())))?;
        let manifest: CacheManifest = serde_json::from_slice(&content)
            .map_err(|e| ZrError::CacheIoError(format!("parsing {}: {e}", manifest_path.display())))?;
        Ok(CacheLookup::Hit(manifest))
    }

    /// Resolve the absolute path of a cached output blob, for restoring it
    /// into a task's working directory on a cache hit.
    #[must_use]
    pub fn blob_path(&self, fingerprint: &str, sha256: &str) -> PathBuf {
        self.entry_dir(fingerprint).join("blobs").join(sha256)
    }

    /// Attempt to acquire the write lock for `fingerprint`, retrying with
    /// jittered exponential backoff while another task holds it.
    ///
    /// Returns `Ok(None)` (contended) once `max_wait` has elapsed without
    /// acquiring the lock; callers should treat this as a cue to run the
    /// task uncached rather than cache the result, per the at-most-once
    /// concurrent build guarantee.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::CacheIoError`] if the lock file or entry
    /// directory cannot be created.
    pub fn begin_write(
        &self,
        fingerprint: &str,
        max_wait: Duration,
    ) -> Result<Option<WriteHandle>, ZrError> {
        let entry_dir = self.entry_dir(fingerprint);
        fs::create_dir_all(&entry_dir)
            .map_err(|e| ZrError::CacheIoError(format!("creating {}: {e}", entry_dir.display())))?;
        let lock_path = entry_dir.join(".lock");
        let lock_file = File::options()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ZrError::CacheIoError(format!("opening {}: {e}", lock_path.display())))?;

        let deadline = Instant::now() + max_wait;
        let mut backoff_ms = BACKOFF_START_MS;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Some(WriteHandle {
                        entry_dir,
                        fingerprint: fingerprint.to_string(),
                        _lock_file: lock_file,
                    }));
                }
                Err(_) if Instant::now() >= deadline => return Ok(None),
                Err(_) => {
                    let jitter_ms = rand::thread_rng().gen_range(0..=(backoff_ms / 2).max(1));
                    std::thread::sleep(Duration::from_millis(backoff_ms + jitter_ms));
                    backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
                }
            }
        }
    }

    /// Remove every entry from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::CacheIoError`] if the root cannot be cleared.
    pub fn clear_all(&self) -> Result<(), ZrError> {
        if !self.root.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&self.root)
            .map_err(|e| ZrError::CacheIoError(format!("clearing {}: {e}", self.root.display())))?;
        fs::create_dir_all(&self.root)
            .map_err(|e| ZrError::CacheIoError(format!("recreating {}: {e}", self.root.display())))?;
        Ok(())
    }

    /// Summarize entry count and on-disk size.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::CacheIoError`] if the root cannot be walked.
    pub fn stats(&self) -> Result<CacheStats, ZrError> {
        let mut stats = CacheStats::default();
        if !self.root.exists() {
            return Ok(stats);
        }
        for shard in walk_dirs(&self.root)? {
            for entry in walk_dirs(&shard)? {
                if entry.join("manifest.json").exists() {
                    stats.entry_count += 1;
                }
                stats.total_bytes += dir_size(&entry)?;
            }
        }
        Ok(stats)
    }
}

fn walk_dirs(dir: &Path) -> Result<Vec<PathBuf>, ZrError> {
    let read = fs::read_dir(dir)
        .map_err(|e| ZrError::CacheIoError(format!("reading {}: {e}", dir.display())))?;
    let mut out = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| ZrError::CacheIoError(format!("walking {}: {e}", dir.display())))?;
        if entry.path().is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn remove_matching(dir: &Path, pred: impl Fn(&str) -> bool) -> Result<(), ZrError> {
    let read = fs::read_dir(dir)
        .map_err(|e| ZrError::CacheIoError(format!("reading {}: {e}", dir.display())))?;
    for entry in read {
        let entry = entry.map_err(|e| ZrError::CacheIoError(format!("walking {}: {e}", dir.display())))?;
        if let Some(name) = entry.file_name().to_str() {
            if pred(name) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

fn dir_size(dir: &Path) -> Result<u64, ZrError> {
    let read = fs::read_dir(dir)
        .map_err(|e| ZrError::CacheIoError(format!("reading {}: {e}", dir.display())))?;
    let mut total = 0_u64;
    for entry in read {
        let entry = entry.map_err(|e| ZrError::CacheIoError(format!("walking {}: {e}", dir.display())))?;
        let meta = entry
            .metadata()
            .map_err(|e| ZrError::CacheIoError(format!("stat {}: {e}", entry.path().display())))?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

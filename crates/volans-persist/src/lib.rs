//! Asynchronous persistence for the on-disk translation cache.
//!
//! One background worker thread drains a FIFO of opaque write jobs. The
//! manager knows nothing about the cache file layout: callers marshal
//! headers and entries themselves and hand over `{path, bytes, offset}`.
//! That keeps the worker a pure I/O pump and keeps every failure local: a
//! failed write bumps a counter and reports through the job's completion
//! callback, and never disturbs the translation loop.
//!
//! On every wake the worker also checks whether the maintenance interval has
//! elapsed and, if so, sweeps the cache directory down to its size bound.
//!
//! [`PersistenceManager::flush`] enqueues a sentinel and blocks until the
//! worker reaches it, which makes all previously queued writes durable: the
//! queue is strictly FIFO.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

pub type Result<T> = std::result::Result<T, PersistError>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("cache directory unavailable: {path}: {source}")]
    CacheDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extension of every file the sweep and [`PersistenceManager::clear_cache`]
/// consider part of the cache.
pub const CACHE_FILE_EXTENSION: &str = "cache";

/// Invoked by the worker with the job's success after the write completes.
pub type Completion = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Debug, Clone)]
pub struct PersistConfig {
    pub cache_dir: PathBuf,
    /// Hard cap for the sweep; the sweep deletes down to 80% of this.
    pub max_cache_bytes: u64,
    pub maintenance_interval: Duration,
}

impl PersistConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_cache_bytes: 1024 * 1024 * 1024,
            maintenance_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub pending_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
}

enum Job {
    Write {
        path: PathBuf,
        bytes: Vec<u8>,
        offset: u64,
        completion: Option<Completion>,
    },
    /// Flush sentinel: reaching it proves every earlier job was processed.
    Barrier(Completion),
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    terminate: AtomicBool,
    completed_jobs: AtomicU64,
    failed_jobs: AtomicU64,
    config: PersistConfig,
}

/// Owner of the cache directory and the single background writer.
pub struct PersistenceManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PersistenceManager {
    /// Create the cache directory (fatal when impossible) and start the
    /// worker thread.
    pub fn new(config: PersistConfig) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir).map_err(|source| PersistError::CacheDir {
            path: config.cache_dir.clone(),
            source,
        })?;

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            terminate: AtomicBool::new(false),
            completed_jobs: AtomicU64::new(0),
            failed_jobs: AtomicU64::new(0),
            config,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("volans-persist".to_string())
            .spawn(move || worker_loop(worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.shared.config.cache_dir
    }

    /// Path of the cache file for a binary identifier.
    pub fn cache_file_path(&self, binary_id: &str) -> PathBuf {
        self.shared
            .config
            .cache_dir
            .join(format!("{binary_id}.{CACHE_FILE_EXTENSION}"))
    }

    /// Queue `bytes` to be written to `path` at `offset`.
    pub fn queue_write(&self, path: PathBuf, bytes: Vec<u8>, offset: u64) {
        self.enqueue(Job::Write {
            path,
            bytes,
            offset,
            completion: None,
        });
    }

    /// Like [`queue_write`](Self::queue_write) with a completion callback
    /// reporting the write's success.
    pub fn queue_write_with(
        &self,
        path: PathBuf,
        bytes: Vec<u8>,
        offset: u64,
        completion: Completion,
    ) {
        self.enqueue(Job::Write {
            path,
            bytes,
            offset,
            completion: Some(completion),
        });
    }

    fn enqueue(&self, job: Job) {
        let mut queue = self.shared.queue.lock().expect("persist queue poisoned");
        queue.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Block until every job queued before this call has been processed.
    pub fn flush(&self) {
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&done);
        self.enqueue(Job::Barrier(Box::new(move |_| {
            let (lock, condvar) = &*signal;
            *lock.lock().expect("flush flag poisoned") = true;
            condvar.notify_one();
        })));

        let (lock, condvar) = &*done;
        let mut finished = lock.lock().expect("flush flag poisoned");
        while !*finished {
            finished = condvar.wait(finished).expect("flush flag poisoned");
        }
    }

    /// Flush, then delete every cache file in the directory.
    pub fn clear_cache(&self) -> Result<()> {
        self.flush();
        for path in cache_files(self.cache_dir())? {
            fs::remove_file(&path)?;
        }
        info!(dir = %self.cache_dir().display(), "cache cleared");
        Ok(())
    }

    /// Run the size-bounded sweep on the caller's thread, regardless of the
    /// maintenance interval.
    pub fn sweep_now(&self) -> Result<SweepOutcome> {
        sweep_directory(self.cache_dir(), self.shared.config.max_cache_bytes)
    }

    pub fn stats(&self) -> PersistStats {
        let pending = self.shared.queue.lock().expect("persist queue poisoned").len();
        PersistStats {
            pending_jobs: pending,
            completed_jobs: self.shared.completed_jobs.load(Ordering::Relaxed),
            failed_jobs: self.shared.failed_jobs.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PersistenceManager {
    fn drop(&mut self) {
        self.flush();
        self.shared.terminate.store(true, Ordering::Release);
        self.shared.available.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut last_maintenance = Instant::now();

    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("persist queue poisoned");
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.terminate.load(Ordering::Acquire) {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("persist queue poisoned");
            }
        };

        let Some(job) = job else {
            break;
        };

        match job {
            Job::Write {
                path,
                bytes,
                offset,
                completion,
            } => {
                let result = write_range(&path, &bytes, offset);
                let ok = match result {
                    Ok(()) => {
                        shared.completed_jobs.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(error) => {
                        shared.failed_jobs.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            path = %path.display(),
                            offset,
                            %error,
                            "cache write failed"
                        );
                        false
                    }
                };
                if let Some(completion) = completion {
                    completion(ok);
                }
            }
            Job::Barrier(completion) => completion(true),
        }

        if last_maintenance.elapsed() >= shared.config.maintenance_interval {
            match sweep_directory(&shared.config.cache_dir, shared.config.max_cache_bytes) {
                Ok(outcome) if outcome.deleted_files > 0 => {
                    info!(
                        deleted = outcome.deleted_files,
                        total_bytes = outcome.total_after,
                        "cache sweep reclaimed space"
                    );
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "cache sweep failed"),
            }
            last_maintenance = Instant::now();
        }
    }

    debug!("persistence worker exited");
}

fn write_range(path: &Path, bytes: &[u8], offset: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    file.flush()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub total_before: u64,
    pub total_after: u64,
    pub deleted_files: usize,
}

/// Enumerate `*.cache` files under `dir`; if their total size exceeds
/// `cap_bytes`, delete oldest-modified first until the total is at or below
/// 80% of the cap.
pub fn sweep_directory(dir: &Path, cap_bytes: u64) -> Result<SweepOutcome> {
    let mut files = Vec::new();
    let mut total: u64 = 0;
    for path in cache_files(dir)? {
        let meta = fs::metadata(&path)?;
        let modified = meta.modified()?;
        total += meta.len();
        files.push((path, meta.len(), modified));
    }

    let total_before = total;
    let mut deleted_files = 0;

    if total > cap_bytes {
        let low_water = cap_bytes / 5 * 4;
        files.sort_by_key(|&(_, _, modified)| modified);

        for (path, len, _) in files {
            if total <= low_water {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    total -= len;
                    deleted_files += 1;
                    debug!(path = %path.display(), len, "cache sweep deleted file");
                }
                Err(error) => warn!(path = %path.display(), %error, "cache sweep delete failed"),
            }
        }
    }

    Ok(SweepOutcome {
        total_before,
        total_after: total,
        deleted_files,
    })
}

fn cache_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == CACHE_FILE_EXTENSION) {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;

    fn manager(dir: &Path) -> PersistenceManager {
        PersistenceManager::new(PersistConfig::new(dir)).unwrap()
    }

    #[test]
    fn writes_bytes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let path = mgr.cache_file_path("abc_1");

        mgr.queue_write(path.clone(), vec![0xAA; 8], 0);
        mgr.queue_write(path.clone(), vec![0xBB; 4], 16);
        mgr.flush();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..8], &[0xAA; 8]);
        // The seek past EOF leaves a zero hole.
        assert_eq!(&bytes[8..16], &[0u8; 8]);
        assert_eq!(&bytes[16..20], &[0xBB; 4]);
    }

    #[test]
    fn overwrite_in_place_preserves_surroundings() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let path = mgr.cache_file_path("abc_2");

        mgr.queue_write(path.clone(), vec![0x11; 32], 0);
        mgr.queue_write(path.clone(), vec![0x22; 8], 8);
        mgr.flush();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..8], &[0x11; 8]);
        assert_eq!(&bytes[8..16], &[0x22; 8]);
        assert_eq!(&bytes[16..32], &[0x11; 16]);
    }

    #[test]
    fn flush_is_a_barrier_for_prior_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let path = mgr.cache_file_path("abc_3");

        for i in 0..32u8 {
            mgr.queue_write(path.clone(), vec![i], u64::from(i));
        }
        mgr.flush();
        let stats = mgr.stats();
        assert_eq!(stats.pending_jobs, 0);
        assert_eq!(stats.completed_jobs, 32);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 32);
        for (i, &b) in bytes.iter().enumerate() {
            assert_eq!(b, i as u8);
        }
    }

    #[test]
    fn completion_reports_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let outcomes = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&outcomes);
        mgr.queue_write_with(
            mgr.cache_file_path("ok_1"),
            vec![1, 2, 3],
            0,
            Box::new(move |ok| sink.lock().unwrap().push(ok)),
        );

        // A directory path cannot be opened as a writable file.
        let sink = Arc::clone(&outcomes);
        mgr.queue_write_with(
            dir.path().to_path_buf(),
            vec![1],
            0,
            Box::new(move |ok| sink.lock().unwrap().push(ok)),
        );
        mgr.flush();

        assert_eq!(*outcomes.lock().unwrap(), vec![true, false]);
        let stats = mgr.stats();
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.failed_jobs, 1);
    }

    #[test]
    fn clear_cache_removes_only_cache_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        mgr.queue_write(mgr.cache_file_path("a_1"), vec![0; 8], 0);
        mgr.queue_write(mgr.cache_file_path("b_2"), vec![0; 8], 0);
        fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();
        mgr.flush();

        mgr.clear_cache().unwrap();

        assert!(!mgr.cache_file_path("a_1").exists());
        assert!(!mgr.cache_file_path("b_2").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    fn write_cache_file(dir: &Path, name: &str, len: usize, age: Duration) {
        let path = dir.join(format!("{name}.{CACHE_FILE_EXTENSION}"));
        fs::write(&path, vec![0u8; len]).unwrap();
        let mtime = SystemTime::now() - age;
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn sweep_deletes_oldest_down_to_low_water() {
        let dir = tempfile::tempdir().unwrap();
        // 11 files of 100 KiB with the cap at 1 MiB: 1100 KiB total, low
        // water 800 KiB, so the three oldest must go.
        for i in 0..11 {
            write_cache_file(
                dir.path(),
                &format!("f{i}"),
                100 * 1024,
                Duration::from_secs(1000 - i * 60),
            );
        }

        let cap = 1024 * 1024;
        let outcome = sweep_directory(dir.path(), cap).unwrap();
        assert_eq!(outcome.total_before, 1100 * 1024);
        assert_eq!(outcome.deleted_files, 3);
        assert!(outcome.total_after <= cap / 5 * 4);

        // f0, f1, f2 are the oldest (largest age).
        for i in 0..3 {
            assert!(!dir.path().join(format!("f{i}.cache")).exists(), "f{i}");
        }
        for i in 3..11 {
            assert!(dir.path().join(format!("f{i}.cache")).exists(), "f{i}");
        }
    }

    #[test]
    fn sweep_below_cap_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        write_cache_file(dir.path(), "small", 1024, Duration::from_secs(60));

        let outcome = sweep_directory(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(outcome.deleted_files, 0);
        assert_eq!(outcome.total_after, outcome.total_before);
        assert!(dir.path().join("small.cache").exists());
    }

    #[test]
    fn sweep_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        write_cache_file(dir.path(), "old", 2048, Duration::from_secs(600));
        fs::write(dir.path().join("image.bin"), vec![0u8; 1 << 20]).unwrap();

        // The .bin file alone exceeds the cap but is not cache-managed.
        let outcome = sweep_directory(dir.path(), 4096).unwrap();
        assert_eq!(outcome.total_before, 2048);
        assert_eq!(outcome.deleted_files, 0);
        assert!(dir.path().join("image.bin").exists());
    }

    #[test]
    fn drop_drains_pending_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mgr = manager(dir.path());
            path = mgr.cache_file_path("drained_1");
            mgr.queue_write(path.clone(), vec![0x77; 16], 0);
        }
        assert_eq!(fs::read(&path).unwrap(), vec![0x77; 16]);
    }
}

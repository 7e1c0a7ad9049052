//! Multi-worker coordination: the shared counters, status array and
//! merged coverage bitmap, plus the driver that spawns workers and
//! fail-fasts the whole run when any of them stops abnormally.
//!
//! All shared state lives behind typed handles created here and passed
//! to workers explicitly. Every read-modify-write runs under a single
//! lock scope, so concurrent bumps can never lose an update.

use crate::config::FuzzConfig;
use crate::fuzzer::WorkerStatus;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

/// Well-known subdirectories of a run's output directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: PathBuf) -> Self {
        OutputLayout { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join("corpus")
    }

    pub fn mismatch_input_dir(&self) -> PathBuf {
        self.root.join("mismatch/sim_input")
    }

    pub fn mismatch_sig_dir(&self) -> PathBuf {
        self.root.join("mismatch/sig")
    }

    pub fn min_input_dir(&self) -> PathBuf {
        self.root.join("mismatch/min_input")
    }

    pub fn illegal_input_dir(&self) -> PathBuf {
        self.root.join("illegal/sim_input")
    }

    pub fn err_dir(&self) -> PathBuf {
        self.root.join("err")
    }

    pub fn isa_timeout_dir(&self) -> PathBuf {
        self.root.join("isa_timeout")
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.root.join("coverage")
    }

    pub fn covmap_path(&self) -> PathBuf {
        self.root.join("covmap/merged.cov")
    }

    pub fn fuzz_log(&self) -> PathBuf {
        self.root.join("fuzz_log")
    }

    pub fn cov_log(&self, date: &str) -> PathBuf {
        self.root.join(format!("cov_log_{}.txt", date))
    }

    pub fn worker_cov_log(&self, date: &str, worker: usize) -> PathBuf {
        self.coverage_dir()
            .join(format!("cov_log_{}_{}.txt", date, worker))
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.corpus_dir(),
            self.mismatch_input_dir(),
            self.mismatch_sig_dir(),
            self.illegal_input_dir(),
            self.err_dir(),
            self.isa_timeout_dir(),
            self.coverage_dir(),
            self.root.join("covmap"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

struct MergedCoverage {
    bits: Vec<u8>,
}

/// State shared between every worker of a run. Each field group has its
/// own mutex; the abort flag is the fail-fast signal workers poll once
/// per iteration.
pub struct SharedState {
    mismatches: Mutex<u64>,
    corpus_count: Mutex<u64>,
    statuses: Mutex<Vec<WorkerStatus>>,
    coverage: Mutex<MergedCoverage>,
    covmap_path: PathBuf,
    cov_log_path: PathBuf,
    abort: AtomicBool,
}

impl SharedState {
    pub fn new(
        num_workers: usize,
        covmap_path: PathBuf,
        cov_log_path: PathBuf,
        start_mismatches: u64,
        start_corpus: u64,
    ) -> Self {
        SharedState {
            mismatches: Mutex::new(start_mismatches),
            corpus_count: Mutex::new(start_corpus),
            statuses: Mutex::new(vec![WorkerStatus::Normal; num_workers]),
            coverage: Mutex::new(MergedCoverage { bits: Vec::new() }),
            covmap_path,
            cov_log_path,
            abort: AtomicBool::new(false),
        }
    }

    /// Claim the next mismatch artifact id.
    pub fn bump_mismatch(&self) -> u64 {
        let mut count = self.mismatches.lock().expect("mismatch counter poisoned");
        let id = *count;
        *count += 1;
        id
    }

    pub fn mismatches(&self) -> u64 {
        *self.mismatches.lock().expect("mismatch counter poisoned")
    }

    /// Claim the next corpus file id.
    pub fn bump_corpus(&self) -> u64 {
        let mut count = self.corpus_count.lock().expect("corpus counter poisoned");
        let id = *count;
        *count += 1;
        id
    }

    pub fn corpus_count(&self) -> u64 {
        *self.corpus_count.lock().expect("corpus counter poisoned")
    }

    pub fn set_status(&self, worker: usize, status: WorkerStatus) {
        let mut statuses = self.statuses.lock().expect("status array poisoned");
        statuses[worker] = status;
    }

    pub fn status(&self, worker: usize) -> WorkerStatus {
        self.statuses.lock().expect("status array poisoned")[worker]
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// OR a worker's private coverage bitmap into the merged one, persist
    /// the merged map, and append a progress record. Returns the merged
    /// population count.
    pub fn merge_coverage(
        &self,
        worker_bits: &[u8],
        elapsed_secs: f64,
        iteration: u64,
    ) -> std::io::Result<u64> {
        let mut merged = self.coverage.lock().expect("coverage map poisoned");
        if merged.bits.len() < worker_bits.len() {
            merged.bits.resize(worker_bits.len(), 0);
        }
        for (slot, &bit) in merged.bits.iter_mut().zip(worker_bits) {
            *slot |= bit;
        }
        let sum: u64 = merged.bits.iter().map(|&b| b as u64).sum();

        let line: String = merged
            .bits
            .iter()
            .map(|&b| if b != 0 { '1' } else { '0' })
            .collect();
        std::fs::write(&self.covmap_path, line)?;

        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cov_log_path)?;
        writeln!(log, "{:<10.1}\t{:<10}\t{:<10}", elapsed_secs, iteration, sum)?;
        Ok(sum)
    }
}

/// Append a record to a coverage progress log, creating it with a header
/// when absent.
pub fn append_cov_record(
    path: &Path,
    elapsed_secs: f64,
    iteration: u64,
    coverage: u64,
) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::write(path, format!("{:<10}\t{:<10}\t{:<10}\n", "time", "iter", "coverage"))?;
    }
    let mut log = std::fs::OpenOptions::new().append(true).open(path)?;
    writeln!(log, "{:<10.1}\t{:<10}\t{:<10}", elapsed_secs, iteration, coverage)
}

/// Iteration and coverage counters to resume from, read off the last
/// record of the merged log.
pub fn resume_point(cov_log: &Path) -> (u64, u64) {
    let Ok(content) = std::fs::read_to_string(cov_log) else {
        return (0, 0);
    };
    let Some(last) = content.lines().rev().find(|l| !l.trim().is_empty()) else {
        return (0, 0);
    };
    let mut fields = last.split_whitespace();
    let _elapsed = fields.next();
    match (
        fields.next().and_then(|f| f.parse().ok()),
        fields.next().and_then(|f| f.parse().ok()),
    ) {
        (Some(iter), Some(cov)) => (iter, cov),
        _ => (0, 0),
    }
}

fn count_entries(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).count() as u64)
        .unwrap_or(0)
}

/// Spawns the workers of a run and owns their shared state. Any worker
/// that returns an error, leaves a non-`Normal` status or panics makes
/// the coordinator signal every sibling to stop and fail the run.
pub struct Coordinator {
    layout: OutputLayout,
    shared: Arc<SharedState>,
    num_workers: usize,
    date: String,
}

impl Coordinator {
    pub fn new(config: &FuzzConfig) -> Result<Coordinator, String> {
        config.validate()?;
        let layout = OutputLayout::new(config.out_dir.clone());
        layout
            .create_dirs()
            .map_err(|e| format!("Failed to create output layout: {}", e))?;

        let date = chrono::Local::now().format("%Y%m%d").to_string();
        let cov_log = layout.cov_log(&date);
        if config.record || config.num_workers > 1 {
            append_cov_record(&cov_log, 0.0, 0, 0)
                .map_err(|e| format!("Failed to start coverage log: {}", e))?;
        }

        // Resume artifact numbering where the previous run left off.
        let shared = Arc::new(SharedState::new(
            config.num_workers,
            layout.covmap_path(),
            cov_log,
            count_entries(&layout.mismatch_input_dir()),
            count_entries(&layout.corpus_dir()),
        ));

        Ok(Coordinator {
            layout,
            shared,
            num_workers: config.num_workers,
            date,
        })
    }

    pub fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn worker_cov_log(&self, worker: usize) -> PathBuf {
        self.layout.worker_cov_log(&self.date, worker)
    }

    /// (start_iter, start_cov) from the merged log of a previous batch.
    pub fn resume(&self) -> (u64, u64) {
        resume_point(&self.layout.cov_log(&self.date))
    }

    /// Run one worker body per index and wait for all of them. Fail-fast:
    /// the first abnormal exit sets the shared abort flag, which every
    /// sibling polls between iterations.
    pub fn run<F, W>(&self, make_worker: F) -> Result<(), String>
    where
        F: Fn(usize) -> W,
        W: FnOnce() -> Result<(), String> + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(self.num_workers);
        for worker in 0..self.num_workers {
            let body = make_worker(worker);
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fuzz-{}", worker))
                .spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(body));
                    let outcome = match &result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(err.clone()),
                        Err(_) => Err("worker panicked".to_string()),
                    };
                    let _ = done_tx.send((worker, outcome));
                })
                .map_err(|e| format!("Failed to spawn worker {}: {}", worker, e))?;
            handles.push(handle);
        }
        drop(done_tx);

        let mut failure = None;
        for _ in 0..self.num_workers {
            let Ok((worker, outcome)) = done_rx.recv() else {
                break;
            };
            let status = self.shared.status(worker);
            match outcome {
                Ok(()) if status == WorkerStatus::Normal => {}
                Ok(()) => {
                    log::error!("worker {} finished in state {}", worker, status.name());
                    self.shared.request_abort();
                    failure.get_or_insert(format!(
                        "worker {} finished in state {}",
                        worker,
                        status.name()
                    ));
                }
                Err(err) => {
                    log::error!("worker {} aborted: {} [{}]", worker, err, status.name());
                    self.shared.request_abort();
                    failure.get_or_insert(format!("worker {} aborted: {}", worker, err));
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        match failure {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }
}

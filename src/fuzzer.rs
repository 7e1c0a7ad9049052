//! The fuzzing control loop: one worker's iteration driver.
//!
//! Each iteration draws an input from the mutator, compiles it, runs the
//! golden ISA simulator under a deadline and the RTL simulation, compares
//! the two signatures, and feeds coverage back into the corpus. The loop
//! classifies every failure: recoverable ones are logged and skipped,
//! fatal ones publish a status code, save a diagnostic artifact and
//! terminate the worker, which fail-fasts the whole run.

use crate::backend::{IsaBackend, IsaTest, Outcome, RtlBackend};
use crate::checker::SigChecker;
use crate::config::FuzzConfig;
use crate::coordinator::{append_cov_record, OutputLayout, SharedState};
use crate::minimizer::{Minimizer, Probe};
use crate::mutator::{Mutator, SimInput};
use crate::preprocessor::{Preprocessor, Toolchain};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker condition published through the coordinator's status array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Normal,
    /// Toolchain failure. Fatal, never retried.
    ErrCompile,
    /// Nonzero ISA-simulator exit. Fatal.
    ErrIsaAssert,
    /// ISA-simulator wall-clock exceeded. Recoverable, iteration skipped.
    ErrIsaTimeout,
    /// RTL driver failure. Fatal.
    ErrRtlSim,
    /// Corrupt `.si` file on disk. The file is skipped.
    ErrSiRead,
}

impl WorkerStatus {
    pub fn name(self) -> &'static str {
        match self {
            WorkerStatus::Normal => "NORMAL",
            WorkerStatus::ErrCompile => "ERR_COMPILE",
            WorkerStatus::ErrIsaAssert => "ERR_ISA_ASSERT",
            WorkerStatus::ErrIsaTimeout => "ERR_ISA_TIMEOUT",
            WorkerStatus::ErrRtlSim => "ERR_RTL_SIM",
            WorkerStatus::ErrSiRead => "ERR_SI_READ",
        }
    }
}

struct Fatal {
    status: WorkerStatus,
    message: String,
}

impl Fatal {
    fn new(status: WorkerStatus, message: impl Into<String>) -> Fatal {
        Fatal {
            status,
            message: message.into(),
        }
    }
}

enum IterEnd {
    Done,
    /// The iteration was abandoned (ISA timeout); no check ran.
    Skipped,
}

pub struct Fuzzer<T: Toolchain, I: IsaBackend, R: RtlBackend> {
    worker: usize,
    num_workers: usize,
    record: bool,
    prob_intr: f64,
    isa_timeout: Duration,
    merge_interval: usize,
    update_interval: usize,
    update_num: usize,
    mutator: Mutator,
    preproc: Preprocessor<T>,
    isa: I,
    rtl: R,
    checker: SigChecker,
    isa_sig: PathBuf,
    rtl_sig: PathBuf,
    layout: OutputLayout,
    shared: Arc<SharedState>,
    cov_log: PathBuf,
    covmap: Vec<u8>,
    last_coverage: u64,
    start: Instant,
    start_iter: u64,
    start_cov: u64,
    illegal_count: usize,
    rng: StdRng,
}

impl<T: Toolchain, I: IsaBackend, R: RtlBackend> Fuzzer<T, I, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &FuzzConfig,
        worker: usize,
        preproc: Preprocessor<T>,
        isa: I,
        rtl: R,
        isa_sig: PathBuf,
        rtl_sig: PathBuf,
        shared: Arc<SharedState>,
        cov_log: PathBuf,
        resume: (u64, u64),
    ) -> Self {
        let seed = config.worker_seed(worker);
        Fuzzer {
            worker,
            num_workers: config.num_workers,
            record: config.record,
            prob_intr: config.prob_intr,
            isa_timeout: Duration::from_secs(config.isa_timeout_secs),
            merge_interval: config.merge_interval,
            update_interval: config.corpus_update_interval,
            update_num: config.corpus_update_num,
            mutator: Mutator::new(
                &config.isa,
                config.corpus_size,
                config.max_data_seeds,
                config.no_guide,
                seed,
            ),
            preproc,
            isa,
            rtl,
            checker: SigChecker::new(isa_sig.clone(), rtl_sig.clone()),
            isa_sig,
            rtl_sig,
            layout: OutputLayout::new(config.out_dir.clone()),
            shared,
            cov_log,
            covmap: Vec::new(),
            last_coverage: 0,
            start: Instant::now(),
            start_iter: resume.0,
            start_cov: resume.1,
            illegal_count: 0,
            rng: StdRng::seed_from_u64(seed.wrapping_add(2)),
        }
    }

    pub fn mutator(&mut self) -> &mut Mutator {
        &mut self.mutator
    }

    /// Drive `num_iter` fuzz iterations, synchronizing coverage and
    /// re-importing sibling corpus files on their configured intervals.
    pub fn run(&mut self, num_iter: usize) -> Result<(), String> {
        log::info!("worker {}: start fuzzing", self.worker);
        for it in 0..num_iter {
            if self.shared.aborted() {
                log::info!("worker {}: sibling failed, stopping", self.worker);
                break;
            }
            self.step(it)?;
            if (it + 1) % self.merge_interval == 0 {
                self.sync_coverage(it as u64 + 1);
            }
            if self.update_interval != 0 && (it + 1) % self.update_interval == 0 {
                let imported = self
                    .mutator
                    .update_corpus(&self.layout.corpus_dir(), self.update_num);
                if imported > 0 {
                    log::debug!("worker {}: re-imported {} corpus files", self.worker, imported);
                }
            }
        }
        self.sync_coverage(num_iter as u64);
        log::info!("worker {}: stop fuzzing", self.worker);
        Ok(())
    }

    /// One iteration with fatal-error bookkeeping applied.
    pub fn step(&mut self, it: usize) -> Result<(), String> {
        match self.run_iteration(it) {
            Ok(_) => Ok(()),
            Err(fatal) => Err(self.fail(fatal)),
        }
    }

    /// Replay a single saved input through one full iteration.
    pub fn replay(&mut self, path: &Path) -> Result<(), String> {
        let parsed = match SimInput::load(path) {
            Ok(parsed) => parsed,
            Err(err) => {
                return Err(self.fail(Fatal::new(WorkerStatus::ErrSiRead, err)));
            }
        };
        let (input, data, assert_intr) = match self.mutator.import_parsed(parsed) {
            Ok(imported) => imported,
            Err(err) => {
                return Err(self.fail(Fatal::new(WorkerStatus::ErrSiRead, err)));
            }
        };
        let seed = input.data_seed;
        let result = match self.fuzz_one(0, input, data, assert_intr) {
            Ok(_) => Ok(()),
            Err(fatal) => Err(self.fail(fatal)),
        };
        self.mutator.release_seed(seed);
        result
    }

    fn fail(&mut self, fatal: Fatal) -> String {
        log::error!("worker {}: {}", self.worker, fatal.message);
        self.shared.set_status(self.worker, fatal.status);
        self.save_err(fatal.status);
        fatal.message
    }

    fn run_iteration(&mut self, it: usize) -> Result<IterEnd, Fatal> {
        let assert_intr = self.prob_intr > 0.0 && self.rng.random_bool(self.prob_intr);
        let (input, data) = self
            .mutator
            .next(assert_intr)
            .map_err(|e| Fatal::new(WorkerStatus::ErrCompile, e))?;
        self.fuzz_one(it, input, data, assert_intr)
    }

    fn fuzz_one(
        &mut self,
        it: usize,
        input: SimInput,
        data: Vec<u64>,
        assert_intr: bool,
    ) -> Result<IterEnd, Fatal> {
        log::debug!("worker {}: iteration [{}]", self.worker, it);

        let prepared = self
            .preproc
            .process(&input, &data, assert_intr)
            .map_err(|e| Fatal::new(WorkerStatus::ErrCompile, e))?;
        let Some(prepared) = prepared else {
            return Err(Fatal::new(
                WorkerStatus::ErrCompile,
                format!("iteration [{}]: compile failed", it),
            ));
        };

        if !self.run_isa(&prepared.isa, it)? {
            self.mutator.update_phase(it);
            return Ok(IterEnd::Skipped);
        }

        let (outcome, coverage) = self
            .rtl
            .run(&prepared.rtl)
            .map_err(|e| Fatal::new(WorkerStatus::ErrRtlSim, e))?;
        if let Some(bits) = self.rtl.covmap() {
            if self.covmap.len() < bits.len() {
                self.covmap.resize(bits.len(), 0);
            }
            for (slot, bit) in self.covmap.iter_mut().zip(bits) {
                *slot |= bit;
            }
        }

        // Mirror an observed interrupt into the ISA side so both backends
        // take the same trap before their signatures are compared.
        if assert_intr && outcome == Outcome::Success {
            let (privilege, epc) = self
                .checker
                .check_interrupt(&prepared.symbols)
                .map_err(|e| Fatal::new(WorkerStatus::ErrRtlSim, e))?;
            if privilege.is_some() {
                let intr_file = self
                    .preproc
                    .write_isa_intr(epc)
                    .map_err(|e| Fatal::new(WorkerStatus::ErrIsaAssert, e))?;
                let rerun = IsaTest {
                    elf: prepared.isa.elf.clone(),
                    intr_file: Some(intr_file),
                };
                if !self.run_isa(&rerun, it)? {
                    self.mutator.update_phase(it);
                    return Ok(IterEnd::Skipped);
                }
            }
        }

        let matched = match outcome {
            Outcome::Success => self
                .checker
                .check(&prepared.symbols)
                .map_err(|e| Fatal::new(WorkerStatus::ErrRtlSim, e))?,
            Outcome::IllegalMemoryAccess => {
                log::info!(
                    "worker {}: memory access outside DRAM -- {}",
                    self.worker,
                    self.illegal_count
                );
                if self.record {
                    let name = format!("id_{}_{}.si", self.worker, self.illegal_count);
                    if let Err(err) = input.save(&self.layout.illegal_input_dir().join(name), &data)
                    {
                        log::warn!("worker {}: {}", self.worker, err);
                    }
                }
                self.illegal_count += 1;
                true
            }
            Outcome::Timeout | Outcome::AssertionFailure => false,
        };

        if !matched {
            let id = self.shared.bump_mismatch();
            let cause = match outcome {
                Outcome::Timeout => "timeout",
                Outcome::AssertionFailure => "assertion fail",
                _ => "mismatch",
            };
            log::warn!("worker {}: iteration [{}] bug -- {} [{}]", self.worker, it, id, cause);
            if self.record {
                self.save_mismatch(&input, &data, id);
            }
        }

        if coverage > self.last_coverage {
            let id = self.shared.bump_corpus();
            if self.record {
                let elapsed = self.start.elapsed().as_secs_f64();
                if let Err(err) = append_cov_record(
                    &self.cov_log,
                    elapsed,
                    self.start_iter + it as u64,
                    self.start_cov + coverage,
                ) {
                    log::warn!("worker {}: coverage log: {}", self.worker, err);
                }
                let path = self.layout.corpus_dir().join(format!("id_{}.si", id));
                if let Err(err) = input.save(&path, &data) {
                    log::warn!("worker {}: {}", self.worker, err);
                }
            }
            self.mutator.add_to_corpus(input);
            self.last_coverage = coverage;
            log::info!(
                "worker {}: iteration [{}] new coverage -- {}",
                self.worker,
                it,
                coverage
            );
        }

        self.mutator.update_phase(it);
        Ok(IterEnd::Done)
    }

    /// Run the ISA simulator under the deadline. `Ok(false)` means the
    /// run timed out and the iteration must be abandoned.
    fn run_isa(&mut self, test: &IsaTest, it: usize) -> Result<bool, Fatal> {
        let run = self
            .isa
            .run(test, self.isa_timeout)
            .map_err(|e| Fatal::new(WorkerStatus::ErrIsaAssert, format!("ISA launch: {}", e)))?;
        if run.timed_out {
            log::warn!("worker {}: iteration [{}] ISA timeout, skipped", self.worker, it);
            self.save_timeout();
            return Ok(false);
        }
        match run.exit_code {
            Some(0) => Ok(true),
            code => Err(Fatal::new(
                WorkerStatus::ErrIsaAssert,
                format!("ISA simulator exited with {:?}", code),
            )),
        }
    }

    fn sync_coverage(&mut self, iteration: u64) {
        if self.covmap.is_empty() {
            return;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        match self
            .shared
            .merge_coverage(&self.covmap, elapsed, self.start_iter + iteration)
        {
            Ok(sum) => log::debug!("worker {}: merged coverage -- {}", self.worker, sum),
            Err(err) => log::warn!("worker {}: coverage merge: {}", self.worker, err),
        }
    }

    fn save_mismatch(&self, input: &SimInput, data: &[u64], id: u64) {
        let si = self.layout.mismatch_input_dir().join(format!("id_{}.si", id));
        if let Err(err) = input.save(&si, data) {
            log::warn!("worker {}: {}", self.worker, err);
            return;
        }
        let sig_dir = self.layout.mismatch_sig_dir();
        for (sig, name) in [
            (&self.isa_sig, format!("isa_sig_{}.txt", id)),
            (&self.rtl_sig, format!("rtl_sig_{}.txt", id)),
        ] {
            if let Err(err) = std::fs::copy(sig, sig_dir.join(name)) {
                log::warn!("worker {}: saving signature: {}", self.worker, err);
            }
        }
    }

    fn save_timeout(&self) {
        let dir = self.layout.isa_timeout_dir();
        for (from, suffix) in [
            (self.preproc.si_path(), "si"),
            (self.preproc.asm_path(), "S"),
            (self.preproc.elf_path(), "elf"),
        ] {
            let to = dir.join(format!("timeout_{}.{}", self.worker, suffix));
            if let Err(err) = std::fs::copy(&from, &to) {
                log::warn!("worker {}: saving timeout artifact: {}", self.worker, err);
            }
        }
    }

    /// Preserve the offending input before the worker dies, so no fatal
    /// case is lost.
    fn save_err(&self, status: WorkerStatus) {
        if status == WorkerStatus::Normal {
            return;
        }
        let line = format!("worker {}: {} occurred\n", self.worker, status.name());
        if let Ok(mut log) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.fuzz_log())
        {
            use std::io::Write;
            let _ = log.write_all(line.as_bytes());
        }
        let to = self
            .layout
            .err_dir()
            .join(format!("err_{}_{}.si", status.name(), self.worker));
        if let Err(err) = std::fs::copy(self.preproc.si_path(), to) {
            log::warn!("worker {}: saving error artifact: {}", self.worker, err);
        }
    }

    /// Minimize this worker's share of the saved mismatch inputs,
    /// writing `<name>_min.si` reproducers next to them. Corrupt files
    /// are skipped.
    pub fn minimize_saved(&mut self) -> Result<usize, String> {
        let in_dir = self.layout.mismatch_input_dir();
        let min_dir = self.layout.min_input_dir();
        std::fs::create_dir_all(&min_dir)
            .map_err(|e| format!("Failed to create {}: {}", min_dir.display(), e))?;

        let mut names: Vec<String> = std::fs::read_dir(&in_dir)
            .map_err(|e| format!("Failed to read {}: {}", in_dir.display(), e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".si"))
            .collect();
        names.sort();

        let mut reduced_count = 0;
        for (index, name) in names.iter().enumerate() {
            if index % self.num_workers != self.worker {
                continue;
            }
            log::info!("worker {}: minimizing {}", self.worker, name);

            let parsed = match SimInput::load(&in_dir.join(name)) {
                Ok(parsed) => parsed,
                Err(err) => {
                    log::warn!("worker {}: skipping {}: {}", self.worker, name, err);
                    continue;
                }
            };
            let (input, data, _) = match self.mutator.import_parsed(parsed) {
                Ok(imported) => imported,
                Err(err) => {
                    log::warn!("worker {}: skipping {}: {}", self.worker, name, err);
                    continue;
                }
            };
            let seed = input.data_seed;

            let preproc = &self.preproc;
            let isa = &self.isa;
            let rtl = &self.rtl;
            let checker = &self.checker;
            let timeout = self.isa_timeout;
            let oracle = |candidate: &SimInput, data: &[u64]| -> Probe {
                let prepared = match preproc.process(candidate, data, false) {
                    Ok(Some(prepared)) => prepared,
                    _ => return Probe::Aborted,
                };
                let run = match isa.run(&prepared.isa, timeout) {
                    Ok(run) => run,
                    Err(_) => return Probe::Aborted,
                };
                if run.timed_out {
                    return Probe::Skipped;
                }
                if run.exit_code != Some(0) {
                    return Probe::Aborted;
                }
                let (outcome, _) = match rtl.run(&prepared.rtl) {
                    Ok(result) => result,
                    Err(_) => return Probe::Aborted,
                };
                match outcome {
                    Outcome::Success => match checker.check(&prepared.symbols) {
                        Ok(true) => Probe::NotReproduced,
                        Ok(false) => Probe::Reproduced,
                        Err(_) => Probe::Aborted,
                    },
                    Outcome::IllegalMemoryAccess => Probe::NotReproduced,
                    Outcome::Timeout | Outcome::AssertionFailure => Probe::Reproduced,
                }
            };

            let reduced = Minimizer::new(&mut self.mutator, oracle).minimize(&input)?;
            let out_name = format!("{}_min.si", name.trim_end_matches(".si"));
            reduced.save(&min_dir.join(out_name), &data)?;
            self.mutator.release_seed(seed);
            reduced_count += 1;
        }
        Ok(reduced_count)
    }
}

#[cfg(test)]
mod tests_fuzzer;

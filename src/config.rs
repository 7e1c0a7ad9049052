//! Run configuration, loaded from a JSON file with per-field defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Everything a fuzzing run is parameterized by. Any field missing from
/// the config file keeps its default, so a minimal file only names the
/// knobs it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzConfig {
    /// Enabled instruction-set profile, e.g. `RV64G`.
    pub isa: String,
    /// Fuzz iterations per worker.
    pub num_iter: usize,
    pub num_workers: usize,
    pub out_dir: PathBuf,
    /// Directory holding the `rv64-*.S` test templates.
    pub template_dir: PathBuf,
    /// Persist corpus files, mismatch artifacts and coverage logs.
    pub record: bool,
    /// Pure random testing: phase stays pinned to Generation.
    pub no_guide: bool,
    /// Probability of asserting an interrupt during an iteration.
    pub prob_intr: f64,
    pub corpus_size: usize,
    pub max_data_seeds: usize,
    /// Wall-clock budget for one ISA-simulator run, in seconds.
    pub isa_timeout_secs: u64,
    /// Iterations between coverage-map merges into the shared bitmap.
    pub merge_interval: usize,
    /// Iterations between best-effort corpus-directory re-imports.
    /// Zero disables the catch-up pass.
    pub corpus_update_interval: usize,
    /// Newest corpus files considered per re-import pass.
    pub corpus_update_num: usize,
    /// Replay a single saved `.si` file instead of fuzzing.
    pub in_file: Option<PathBuf>,
    /// Minimize the saved mismatch inputs instead of fuzzing.
    pub minimize: bool,
    /// Base RNG seed; workers derive their own from it. Seeded from the
    /// clock when absent.
    pub seed: Option<u64>,
    pub cc: String,
    pub elf2hex: String,
    pub spike: String,
    pub spike_args: Vec<String>,
    pub rtl_cmd: String,
    pub rtl_args: Vec<String>,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        FuzzConfig {
            isa: "RV64G".to_string(),
            num_iter: 1,
            num_workers: 1,
            out_dir: PathBuf::from("output"),
            template_dir: PathBuf::from("Template"),
            record: false,
            no_guide: false,
            prob_intr: 0.0,
            corpus_size: 1000,
            max_data_seeds: 100,
            isa_timeout_secs: 1,
            merge_interval: 100,
            corpus_update_interval: 0,
            corpus_update_num: 10,
            in_file: None,
            minimize: false,
            seed: None,
            cc: "riscv64-unknown-elf-gcc".to_string(),
            elf2hex: "riscv64-unknown-elf-elf2hex".to_string(),
            spike: "spike".to_string(),
            spike_args: Vec::new(),
            rtl_cmd: "rtlsim".to_string(),
            rtl_args: Vec::new(),
        }
    }
}

impl FuzzConfig {
    pub fn load(path: &Path) -> Result<FuzzConfig, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        let config: FuzzConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_workers == 0 {
            return Err("num_workers must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.prob_intr) {
            return Err(format!("prob_intr {} outside [0, 1]", self.prob_intr));
        }
        if self.corpus_size == 0 {
            return Err("corpus_size must be at least 1".to_string());
        }
        if self.merge_interval == 0 {
            return Err("merge_interval must be at least 1".to_string());
        }
        Ok(())
    }

    /// RNG seed for one worker, spread so siblings never share a stream.
    pub fn worker_seed(&self, worker: usize) -> u64 {
        let base = self.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        });
        base.wrapping_add(0x9e37_79b9_7f4a_7c15u64.wrapping_mul(worker as u64 + 1))
    }
}

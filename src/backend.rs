//! Execution backends: the golden ISA simulator and the RTL simulation
//! driver, consumed through narrow traits so the fuzz loop and the
//! minimizer can run against test doubles.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

/// Symbol-name to address bindings extracted from the linked test binary.
pub type SymbolTable = BTreeMap<String, u64>;

/// Result of one RTL simulation, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AssertionFailure,
    Timeout,
    /// Access outside the declared DRAM range. Treated as an automatic
    /// pass and recorded separately, never as a correctness bug.
    IllegalMemoryAccess,
}

impl Outcome {
    pub fn from_code(code: i64) -> Option<Outcome> {
        match code {
            0 => Some(Outcome::Success),
            1 => Some(Outcome::AssertionFailure),
            2 => Some(Outcome::Timeout),
            -1 => Some(Outcome::IllegalMemoryAccess),
            _ => None,
        }
    }
}

/// One prepared ISA-simulator run.
#[derive(Debug, Clone)]
pub struct IsaTest {
    pub elf: PathBuf,
    /// Interrupt-injection file for the trap-aware second run.
    pub intr_file: Option<PathBuf>,
}

/// One prepared RTL run.
#[derive(Debug, Clone)]
pub struct RtlTest {
    pub hex: PathBuf,
    pub intr_file: Option<PathBuf>,
    pub data: Vec<u64>,
    pub symbols: SymbolTable,
    pub max_cycles: u64,
}

/// Outcome of an ISA run wrapped in a wall-clock deadline.
#[derive(Debug, Clone, Copy)]
pub struct IsaRun {
    /// Process exit code; `None` when the run was killed.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

pub trait IsaBackend {
    /// Run the golden simulator on a linked test binary under a hard
    /// deadline. On expiry the entire process group spawned for the run
    /// is force-killed and `timed_out` is reported instead of an exit
    /// code.
    fn run(&self, test: &IsaTest, timeout: Duration) -> io::Result<IsaRun>;
}

pub trait RtlBackend {
    /// Run the RTL simulation. `Err` means the driver itself failed,
    /// which is fatal for the owning worker.
    fn run(&self, test: &RtlTest) -> Result<(Outcome, u64), String>;

    /// Coverage bitmap of the last run, one byte per cover point, if the
    /// driver produces one.
    fn covmap(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Golden-simulator backend shelling out to `spike` (or a compatible
/// replacement). The signature dump lands in `sig_file` for the checker.
pub struct SpikeIsa {
    pub command: String,
    pub args: Vec<String>,
    pub sig_file: PathBuf,
}

impl IsaBackend for SpikeIsa {
    fn run(&self, test: &IsaTest, timeout: Duration) -> io::Result<IsaRun> {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg(format!("+signature={}", self.sig_file.display()));
        if let Some(intr) = &test.intr_file {
            cmd.arg(format!("+intrfile={}", intr.display()));
        }
        cmd.arg(&test.elf);

        // The run gets its own process group so a timeout can reap the
        // simulator together with anything it spawned.
        let mut child = cmd.process_group(0).spawn()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(IsaRun {
                    exit_code: status.code(),
                    timed_out: false,
                });
            }
            if Instant::now() >= deadline {
                unsafe {
                    libc::kill(-(child.id() as i32), libc::SIGKILL);
                }
                let _ = child.wait();
                return Ok(IsaRun {
                    exit_code: None,
                    timed_out: true,
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// RTL backend shelling out to an external simulation driver.
///
/// Contract: the driver is invoked with the hex image, the cycle budget
/// and, when present, the interrupt file; it writes
/// `<outcome_code> <coverage>` to `result_file` and exits zero. A nonzero
/// or signaled exit, or an unreadable result file, is a driver failure.
pub struct ExternalRtl {
    pub command: String,
    pub args: Vec<String>,
    pub result_file: PathBuf,
    /// Bitmap the driver dumps after each run, one `0`/`1` character per
    /// cover point.
    pub covmap_file: PathBuf,
}

impl RtlBackend for ExternalRtl {
    fn run(&self, test: &RtlTest) -> Result<(Outcome, u64), String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg(&test.hex);
        cmd.arg(format!("+max-cycles={}", test.max_cycles));
        if let Some(intr) = &test.intr_file {
            cmd.arg(format!("+intrfile={}", intr.display()));
        }

        let status = cmd
            .status()
            .map_err(|e| format!("failed to launch RTL driver {}: {}", self.command, e))?;
        if !status.success() {
            return Err(format!("RTL driver exited with {}", status));
        }

        let text = std::fs::read_to_string(&self.result_file)
            .map_err(|e| format!("no RTL result file {}: {}", self.result_file.display(), e))?;
        let mut fields = text.split_whitespace();
        let outcome: i64 = fields
            .next()
            .ok_or("empty RTL result file")?
            .parse()
            .map_err(|_| "malformed RTL outcome code".to_string())?;
        let coverage: u64 = fields
            .next()
            .ok_or("RTL result file lacks coverage")?
            .parse()
            .map_err(|_| "malformed RTL coverage".to_string())?;

        let outcome =
            Outcome::from_code(outcome).ok_or_else(|| format!("unknown outcome code {}", outcome))?;
        Ok((outcome, coverage))
    }

    fn covmap(&self) -> Option<Vec<u8>> {
        let line = std::fs::read_to_string(&self.covmap_file).ok()?;
        Some(
            line.trim_end()
                .bytes()
                .map(|c| u8::from(c == b'1'))
                .collect(),
        )
    }
}

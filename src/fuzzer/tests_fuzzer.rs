use super::*;
use crate::backend::{IsaRun, RtlTest, SymbolTable};
use crate::coordinator::SharedState;
use crate::isa::{CSR_NAMES, NUM_DATA_SECTIONS};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;

const DATA_BYTES: u64 = 32;

fn full_symbols() -> SymbolTable {
    let mut symbols = SymbolTable::new();
    symbols.insert("_fuzz_main".to_string(), 0x8000_0000);
    let begin = 0x8000_1000u64;
    symbols.insert("begin_signature".to_string(), begin);
    for i in 0..32u64 {
        symbols.insert(format!("reg_x{}_output", i), begin + 8 * i);
    }
    for i in 0..32u64 {
        symbols.insert(format!("reg_f{}_output", i), begin + 0x100 + 8 * i);
    }
    for (k, name) in CSR_NAMES.iter().enumerate() {
        symbols.insert(format!("{}_output", name), begin + 0x200 + 8 * k as u64);
    }
    symbols.insert("end_signature".to_string(), begin + 8 * 94);
    for i in 0..NUM_DATA_SECTIONS as u64 {
        symbols.insert(format!("_random_data{}", i), 0x8800_0000 + DATA_BYTES * i);
        symbols.insert(format!("_end_data{}", i), 0x8800_0000 + DATA_BYTES * (i + 1));
    }
    symbols
}

fn write_sig(path: &Path, tweak: u64) {
    let mut words: Vec<u64> = (0..94).map(|i| 0x1111_0000 + i as u64).collect();
    words[5] ^= tweak;
    words.extend((0..(NUM_DATA_SECTIONS as u64 * DATA_BYTES / 8)).map(|i| 0x2222_0000 + i));
    let mut out = String::new();
    for pair in words.chunks(2) {
        out.push_str(&format!("{:016x}{:016x}\n", pair.get(1).copied().unwrap_or(0), pair[0]));
    }
    std::fs::write(path, out).unwrap();
}

struct MockToolchain {
    cc_exit: i32,
}

impl Toolchain for MockToolchain {
    fn assemble_and_link(&self, _source: &Path, _elf: &Path, _flags: &[String]) -> io::Result<i32> {
        Ok(self.cc_exit)
    }

    fn elf_to_hex(&self, _elf: &Path, hex: &Path) -> io::Result<i32> {
        std::fs::write(hex, "")?;
        Ok(0)
    }

    fn read_symbols(&self, _elf: &Path) -> io::Result<SymbolTable> {
        Ok(full_symbols())
    }
}

struct MockIsa {
    script: RefCell<VecDeque<IsaRun>>,
    calls: Cell<usize>,
}

impl MockIsa {
    fn ok() -> Self {
        MockIsa {
            script: RefCell::new(VecDeque::new()),
            calls: Cell::new(0),
        }
    }

    fn scripted(runs: Vec<IsaRun>) -> Self {
        MockIsa {
            script: RefCell::new(runs.into()),
            calls: Cell::new(0),
        }
    }
}

impl IsaBackend for MockIsa {
    fn run(&self, _test: &IsaTest, _timeout: Duration) -> io::Result<IsaRun> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.script.borrow_mut().pop_front().unwrap_or(IsaRun {
            exit_code: Some(0),
            timed_out: false,
        }))
    }
}

struct MockRtl {
    script: RefCell<VecDeque<Result<(Outcome, u64), String>>>,
    fallback: Result<(Outcome, u64), String>,
    calls: Cell<usize>,
}

impl MockRtl {
    fn seq(outcomes: Vec<(Outcome, u64)>) -> Self {
        MockRtl {
            script: RefCell::new(outcomes.into_iter().map(Ok).collect()),
            fallback: Ok((Outcome::Success, 0)),
            calls: Cell::new(0),
        }
    }

    fn failing(message: &str) -> Self {
        MockRtl {
            script: RefCell::new(VecDeque::new()),
            fallback: Err(message.to_string()),
            calls: Cell::new(0),
        }
    }
}

impl RtlBackend for MockRtl {
    fn run(&self, _test: &RtlTest) -> Result<(Outcome, u64), String> {
        self.calls.set(self.calls.get() + 1);
        self.script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct Rig {
    fuzzer: Fuzzer<MockToolchain, MockIsa, MockRtl>,
    shared: Arc<SharedState>,
    out: PathBuf,
}

fn rig(tag: &str, cc_exit: i32, isa: MockIsa, rtl: MockRtl) -> Rig {
    let out = std::env::temp_dir().join(format!("harrow_fuzz_{}", tag));
    let _ = std::fs::remove_dir_all(&out);

    let mut config = FuzzConfig::default();
    config.out_dir = out.clone();
    config.template_dir = out.join("template");
    config.record = true;
    config.corpus_size = 10;
    config.max_data_seeds = 4;
    config.seed = Some(0x5eed);
    OutputLayout::new(out.clone()).create_dirs().unwrap();

    std::fs::create_dir_all(&config.template_dir).unwrap();
    let mut template = String::from("_fuzz_prefix:\n_fuzz_main:\n_fuzz_suffix:\n");
    for section in 0..NUM_DATA_SECTIONS {
        template.push_str(&format!("_random_data{}:\n_end_data{}:\n", section, section));
    }
    for name in ["p-m", "p-s", "p-u", "v-u"] {
        std::fs::write(config.template_dir.join(format!("rv64-{}.S", name)), &template).unwrap();
    }

    let isa_sig = out.join(".isa_sig_0.txt");
    let rtl_sig = out.join(".rtl_sig_0.txt");
    write_sig(&isa_sig, 0);
    write_sig(&rtl_sig, 0);

    let shared = Arc::new(SharedState::new(
        1,
        out.join("covmap/merged.cov"),
        out.join("cov_log.txt"),
        0,
        0,
    ));
    let preproc = Preprocessor::new(
        MockToolchain { cc_exit },
        config.template_dir.clone(),
        out.clone(),
        0,
    );
    let mut fuzzer = Fuzzer::new(
        &config,
        0,
        preproc,
        isa,
        rtl,
        isa_sig,
        rtl_sig,
        shared.clone(),
        out.join("coverage/cov_log_0.txt"),
        (0, 0),
    );
    fuzzer.mutator().num_prefix = 2;
    fuzzer.mutator().num_main = 4;
    fuzzer.mutator().num_suffix = 2;
    Rig { fuzzer, shared, out }
}

#[test]
fn rising_coverage_inserts_into_the_corpus() {
    let rtl = MockRtl::seq(vec![
        (Outcome::Success, 0),
        (Outcome::Success, 0),
        (Outcome::Success, 3),
        (Outcome::Success, 3),
        (Outcome::Success, 5),
    ]);
    let mut rig = rig("covseq", 0, MockIsa::ok(), rtl);

    rig.fuzzer.run(5).unwrap();

    // Coverage [0,0,3,3,5]: exactly the 3 and the 5 produce insertions.
    assert_eq!(rig.shared.corpus_count(), 2);
    assert_eq!(rig.shared.mismatches(), 0);
    assert_eq!(rig.fuzzer.mutator().corpus_len(), 2);
    assert!(rig.out.join("corpus/id_0.si").exists());
    assert!(rig.out.join("corpus/id_1.si").exists());
    assert!(!rig.out.join("corpus/id_2.si").exists());
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn signature_divergence_is_recorded_as_a_mismatch() {
    let mut rig = rig("diverge", 0, MockIsa::ok(), MockRtl::seq(vec![(Outcome::Success, 0)]));
    write_sig(&rig.out.join(".rtl_sig_0.txt"), 0xdead);

    rig.fuzzer.step(0).unwrap();

    assert_eq!(rig.shared.mismatches(), 1);
    assert!(rig.out.join("mismatch/sim_input/id_0.si").exists());
    assert!(rig.out.join("mismatch/sig/isa_sig_0.txt").exists());
    assert!(rig.out.join("mismatch/sig/rtl_sig_0.txt").exists());
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn rtl_timeout_is_a_bug_even_without_a_signature() {
    let mut rig = rig("rtlto", 0, MockIsa::ok(), MockRtl::seq(vec![(Outcome::Timeout, 0)]));
    rig.fuzzer.step(0).unwrap();
    assert_eq!(rig.shared.mismatches(), 1);
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn illegal_memory_access_passes_and_is_filed_separately() {
    let rtl = MockRtl::seq(vec![(Outcome::IllegalMemoryAccess, 0)]);
    let mut rig = rig("illmem", 0, MockIsa::ok(), rtl);
    rig.fuzzer.step(0).unwrap();

    assert_eq!(rig.shared.mismatches(), 0);
    assert!(rig.out.join("illegal/sim_input/id_0_0.si").exists());
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn compile_failure_is_fatal_and_publishes_status() {
    let mut rig = rig("ccfatal", 1, MockIsa::ok(), MockRtl::seq(vec![]));
    assert!(rig.fuzzer.step(0).is_err());
    assert_eq!(rig.shared.status(0), WorkerStatus::ErrCompile);
    assert!(rig.out.join("err/err_ERR_COMPILE_0.si").exists());
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn isa_timeout_skips_the_iteration_quietly() {
    let isa = MockIsa::scripted(vec![IsaRun {
        exit_code: None,
        timed_out: true,
    }]);
    let rtl = MockRtl::seq(vec![]);
    let mut rig = rig("isato", 0, isa, rtl);

    rig.fuzzer.step(0).unwrap();

    assert_eq!(rig.shared.status(0), WorkerStatus::Normal);
    assert_eq!(rig.fuzzer.rtl.calls.get(), 0, "RTL ran after an abandoned iteration");
    assert!(rig.out.join("isa_timeout/timeout_0.S").exists());
    assert!(rig.out.join("isa_timeout/timeout_0.si").exists());
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn isa_assertion_is_fatal() {
    let isa = MockIsa::scripted(vec![IsaRun {
        exit_code: Some(3),
        timed_out: false,
    }]);
    let mut rig = rig("isaassert", 0, isa, MockRtl::seq(vec![]));
    assert!(rig.fuzzer.step(0).is_err());
    assert_eq!(rig.shared.status(0), WorkerStatus::ErrIsaAssert);
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn rtl_driver_failure_is_fatal() {
    let mut rig = rig("rtlfatal", 0, MockIsa::ok(), MockRtl::failing("bus protocol wedged"));
    let err = rig.fuzzer.step(0).unwrap_err();
    assert!(err.contains("bus protocol wedged"));
    assert_eq!(rig.shared.status(0), WorkerStatus::ErrRtlSim);
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn replay_reruns_a_saved_input() {
    let mut rig = rig("replay", 0, MockIsa::ok(), MockRtl::seq(vec![(Outcome::Success, 7)]));

    let saved = rig.out.join("saved.si");
    {
        let mutator = rig.fuzzer.mutator();
        let (input, data) = mutator.next(false).unwrap();
        input.save(&saved, &data).unwrap();
    }

    rig.fuzzer.replay(&saved).unwrap();
    assert_eq!(rig.shared.status(0), WorkerStatus::Normal);
    // The replayed run found coverage and entered the corpus.
    assert_eq!(rig.shared.corpus_count(), 1);
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn replay_of_a_corrupt_file_reports_si_read() {
    let mut rig = rig("corrupt", 0, MockIsa::ok(), MockRtl::seq(vec![]));
    let bad = rig.out.join("bad.si");
    std::fs::write(&bad, "not a sim input\n").unwrap();

    assert!(rig.fuzzer.replay(&bad).is_err());
    assert_eq!(rig.shared.status(0), WorkerStatus::ErrSiRead);
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn minimize_saved_writes_a_reduced_reproducer() {
    // The RTL keeps asserting, so every probe reproduces and the whole
    // input collapses.
    let rtl = MockRtl {
        script: RefCell::new(VecDeque::new()),
        fallback: Ok((Outcome::AssertionFailure, 0)),
        calls: Cell::new(0),
    };
    let mut rig = rig("minimize", 0, MockIsa::ok(), rtl);

    let mismatch = rig.out.join("mismatch/sim_input/id_0.si");
    {
        let mutator = rig.fuzzer.mutator();
        let (input, data) = mutator.next(false).unwrap();
        input.save(&mismatch, &data).unwrap();
    }

    assert_eq!(rig.fuzzer.minimize_saved().unwrap(), 1);
    let min_path = rig.out.join("mismatch/min_input/id_0_min.si");
    let parsed = SimInput::load(&min_path).unwrap();
    assert!(parsed.main.is_empty());
    assert!(parsed.prefix.is_empty());
    let _ = std::fs::remove_dir_all(&rig.out);
}

#[test]
fn private_covmap_accumulates_and_merges() {
    struct CovRtl {
        maps: RefCell<VecDeque<Vec<u8>>>,
        last: RefCell<Vec<u8>>,
    }
    impl RtlBackend for CovRtl {
        fn run(&self, _test: &RtlTest) -> Result<(Outcome, u64), String> {
            *self.last.borrow_mut() = self.maps.borrow_mut().pop_front().unwrap_or_default();
            Ok((Outcome::Success, 0))
        }

        fn covmap(&self) -> Option<Vec<u8>> {
            Some(self.last.borrow().clone())
        }
    }

    let out = std::env::temp_dir().join("harrow_fuzz_covmap");
    let _ = std::fs::remove_dir_all(&out);
    let mut config = FuzzConfig::default();
    config.out_dir = out.clone();
    config.template_dir = out.join("template");
    config.record = true;
    config.merge_interval = 2;
    config.seed = Some(0x5eed);
    OutputLayout::new(out.clone()).create_dirs().unwrap();
    std::fs::create_dir_all(&config.template_dir).unwrap();
    let mut template = String::from("_fuzz_prefix:\n_fuzz_main:\n_fuzz_suffix:\n");
    for section in 0..NUM_DATA_SECTIONS {
        template.push_str(&format!("_random_data{}:\n_end_data{}:\n", section, section));
    }
    for name in ["p-m", "p-s", "p-u", "v-u"] {
        std::fs::write(config.template_dir.join(format!("rv64-{}.S", name)), &template).unwrap();
    }
    let isa_sig = out.join(".isa_sig_0.txt");
    let rtl_sig = out.join(".rtl_sig_0.txt");
    write_sig(&isa_sig, 0);
    write_sig(&rtl_sig, 0);
    let shared = Arc::new(SharedState::new(
        1,
        out.join("covmap/merged.cov"),
        out.join("cov_log.txt"),
        0,
        0,
    ));
    let preproc = Preprocessor::new(MockToolchain { cc_exit: 0 }, config.template_dir.clone(), out.clone(), 0);
    let rtl = CovRtl {
        maps: RefCell::new(VecDeque::from([vec![1, 0, 0, 1], vec![0, 1, 0, 0]])),
        last: RefCell::new(Vec::new()),
    };
    let mut fuzzer = Fuzzer::new(
        &config,
        0,
        preproc,
        MockIsa::ok(),
        rtl,
        isa_sig,
        rtl_sig,
        shared,
        out.join("coverage/cov_log_0.txt"),
        (0, 0),
    );
    fuzzer.mutator().num_prefix = 1;
    fuzzer.mutator().num_main = 2;
    fuzzer.mutator().num_suffix = 1;

    fuzzer.run(2).unwrap();

    let merged = std::fs::read_to_string(out.join("covmap/merged.cov")).unwrap();
    assert_eq!(merged, "1101");
    let _ = std::fs::remove_dir_all(&out);
}

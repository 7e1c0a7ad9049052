use harrow::backend::{ExternalRtl, SpikeIsa};
use harrow::coordinator::Coordinator;
use harrow::preprocessor::{Preprocessor, RiscvToolchain};
use harrow::{FuzzConfig, Fuzzer};
use std::path::{Path, PathBuf};

fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match FuzzConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(2);
            }
        },
        None => FuzzConfig::default(),
    };

    if let Err(err) = run(config) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run(config: FuzzConfig) -> Result<(), String> {
    let coordinator = Coordinator::new(&config)?;
    let shared = coordinator.shared();
    let resume = coordinator.resume();

    let worker_logs: Vec<PathBuf> = (0..config.num_workers)
        .map(|worker| coordinator.worker_cov_log(worker))
        .collect();

    coordinator.run(|worker| {
        let config = config.clone();
        let shared = shared.clone();
        let cov_log = worker_logs[worker].clone();

        move || -> Result<(), String> {
            let out = config.out_dir.clone();
            let stem = |suffix: &str| out.join(format!(".{}_{}.txt", suffix, worker));
            let isa_sig = stem("isa_sig");
            let rtl_sig = stem("rtl_sig");

            let tool = RiscvToolchain {
                cc: config.cc.clone(),
                elf2hex: config.elf2hex.clone(),
                include_dir: config.template_dir.clone(),
            };
            let preproc = Preprocessor::new(tool, config.template_dir.clone(), out.clone(), worker);
            let isa = SpikeIsa {
                command: config.spike.clone(),
                args: config.spike_args.clone(),
                sig_file: isa_sig.clone(),
            };
            let rtl = ExternalRtl {
                command: config.rtl_cmd.clone(),
                args: config.rtl_args.clone(),
                result_file: stem("rtl_result"),
                covmap_file: stem("covmap"),
            };

            let mut fuzzer = Fuzzer::new(
                &config, worker, preproc, isa, rtl, isa_sig, rtl_sig, shared, cov_log, resume,
            );

            if config.minimize {
                fuzzer.minimize_saved().map(|_| ())
            } else if let Some(in_file) = &config.in_file {
                fuzzer.replay(in_file)
            } else {
                fuzzer.run(config.num_iter)
            }
        }
    })
}

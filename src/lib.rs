//! Harrow - a coverage-guided differential fuzzer for RISC-V RTL designs
//!
//! This library generates instruction sequences, runs them on a golden
//! ISA simulator and the RTL under test, and reports signature
//! mismatches as bugs.

pub mod backend;
pub mod checker;
pub mod config;
pub mod coordinator;
pub mod fuzzer;
pub mod generator;
pub mod isa;
pub mod minimizer;
pub mod mutator;
pub mod preprocessor;
pub mod word;

pub use config::FuzzConfig;
pub use fuzzer::{Fuzzer, WorkerStatus};
pub use mutator::{Mutator, SimInput};

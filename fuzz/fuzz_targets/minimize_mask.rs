#![no_main]

use harrow::minimizer::{Minimizer, Probe};
use harrow::{Mutator, SimInput};
use libfuzzer_sys::fuzz_target;
use std::cell::Cell;

// The mask search must terminate and only ever shrink the input, no
// matter how adversarial the oracle's answers are.
fuzz_target!(|data: &[u8]| {
    if data.len() < 10 {
        return;
    }
    let seed = u64::from_le_bytes(data[..8].try_into().unwrap());
    let main_len = (data[8] % 12) as usize + 1;
    let answers: Vec<u8> = data[9..data.len().min(64)].to_vec();

    let mut mutator = Mutator::new("RV64G", 8, 4, false, seed);
    mutator.num_prefix = 1;
    mutator.num_main = main_len;
    mutator.num_suffix = 1;
    let (input, _) = mutator.next(false).unwrap();

    let cursor = Cell::new(0usize);
    let oracle = move |_: &SimInput, _: &[u64]| -> Probe {
        let i = cursor.get();
        cursor.set(i + 1);
        match answers.get(i % answers.len().max(1)).copied().unwrap_or(0) % 4 {
            0 => Probe::Reproduced,
            1 => Probe::NotReproduced,
            2 => Probe::Skipped,
            _ => Probe::Aborted,
        }
    };

    let reduced = Minimizer::new(&mut mutator, oracle).minimize(&input).unwrap();
    assert!(reduced.prefix.len() <= input.prefix.len());
    assert!(reduced.main.len() <= input.main.len());
    assert!(reduced.suffix.len() <= input.suffix.len());
    assert_eq!(reduced.interrupts.len(), reduced.main_inst_count());
});

#![no_main]

use harrow::word::Region;
use harrow::Mutator;
use libfuzzer_sys::fuzz_target;

// Drive the phase machine through an arbitrary schedule and check the
// structural invariants every produced input must keep: contiguous
// labels and strictly-forward symbol references.
fuzz_target!(|data: &[u8]| {
    if data.len() < 9 {
        return;
    }
    let seed = u64::from_le_bytes(data[..8].try_into().unwrap());
    let schedule = &data[8..data.len().min(40)];

    let mut mutator = Mutator::new("RV64G", 16, 4, false, seed);
    mutator.num_prefix = 2;
    mutator.num_main = 5;
    mutator.num_suffix = 2;

    for (step, &byte) in schedule.iter().enumerate() {
        let (input, _) = mutator.next(byte & 1 == 1).unwrap();

        for region in Region::all() {
            let words = input.region(region);
            let max_label = words.len();
            for (position, word) in words.iter().enumerate() {
                assert_eq!(word.label, position);
                for target in word.forward_targets() {
                    assert!(target > word.label && target <= max_label);
                }
            }
        }
        assert_eq!(input.interrupts.len(), input.main_inst_count());

        if byte & 2 == 2 {
            mutator.add_to_corpus(input);
        }
        mutator.update_phase(step.wrapping_add(byte as usize));
    }
});

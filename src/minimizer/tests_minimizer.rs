use super::*;
use crate::mutator::Mutator;
use std::cell::Cell;
use std::rc::Rc;

fn mutator_with_input(main_words: usize, seed: u64) -> (Mutator, SimInput) {
    let mut mutator = Mutator::new("RV64G", 10, 4, false, seed);
    mutator.num_prefix = 2;
    mutator.num_main = main_words;
    mutator.num_suffix = 2;
    let (input, _) = mutator.next(false).unwrap();
    (mutator, input)
}

#[test]
fn always_reproducing_oracle_reduces_every_region() {
    let (mut mutator, input) = mutator_with_input(4, 21);
    let mut minimizer = Minimizer::new(&mut mutator, |_: &SimInput, _: &[u64]| Probe::Reproduced);
    let reduced = minimizer.minimize(&input).unwrap();

    // Everything was replaceable, so the delete pass empties the input.
    assert!(reduced.prefix.is_empty());
    assert!(reduced.main.is_empty());
    assert!(reduced.suffix.is_empty());
    assert!(reduced.interrupts.is_empty());
}

#[test]
fn never_reproducing_oracle_leaves_the_input_intact() {
    let (mut mutator, input) = mutator_with_input(5, 22);
    let mut minimizer = Minimizer::new(&mut mutator, |_: &SimInput, _: &[u64]| Probe::NotReproduced);
    let reduced = minimizer.minimize(&input).unwrap();

    assert_eq!(reduced.prefix.len(), input.prefix.len());
    assert_eq!(reduced.main.len(), input.main.len());
    assert_eq!(reduced.suffix.len(), input.suffix.len());
}

#[test]
fn four_word_region_probes_within_two_rounds() {
    let (mut mutator, mut input) = mutator_with_input(4, 23);
    // Isolate the main region so the probe count is exactly its own.
    input.prefix.clear();
    input.suffix.clear();

    let probes = Rc::new(Cell::new(0));
    let counter = probes.clone();
    let mut minimizer = Minimizer::new(&mut mutator, move |_: &SimInput, _: &[u64]| {
        counter.set(counter.get() + 1);
        Probe::NotReproduced
    });
    let reduced = minimizer.minimize(&input).unwrap();

    // ceil(log2 4) = 2 rounds: one 2-chunk round (2 probes) plus one
    // 1-chunk round (4 probes).
    assert_eq!(probes.get(), 6);
    assert!(reduced.main.len() <= 4);
}

#[test]
fn accepted_mask_grows_monotonically() {
    let (mut mutator, mut input) = mutator_with_input(8, 24);
    input.prefix.clear();
    input.suffix.clear();

    // Accept every other probe; the surviving nop count must never
    // shrink between accepted candidates.
    let accepted_sizes = Rc::new(std::cell::RefCell::new(Vec::new()));
    let log = accepted_sizes.clone();
    let flip = Cell::new(false);
    let mut minimizer = Minimizer::new(&mut mutator, move |candidate: &SimInput, _: &[u64]| {
        flip.set(!flip.get());
        if flip.get() {
            let nops = candidate.main.iter().filter(|w| w.is_nop()).count();
            log.borrow_mut().push(nops);
            Probe::Reproduced
        } else {
            Probe::NotReproduced
        }
    });
    minimizer.minimize(&input).unwrap();

    let sizes = accepted_sizes.borrow();
    assert!(!sizes.is_empty());
    for pair in sizes.windows(2) {
        assert!(pair[1] >= pair[0], "accepted mask shrank: {:?}", *sizes);
    }
}

#[test]
fn reduced_region_is_never_longer_than_the_original() {
    for seed in [30, 31, 32] {
        let (mut mutator, input) = mutator_with_input(7, seed);
        let flip = Cell::new(false);
        let mut minimizer = Minimizer::new(&mut mutator, move |_: &SimInput, _: &[u64]| {
            flip.set(!flip.get());
            if flip.get() {
                Probe::Reproduced
            } else {
                Probe::NotReproduced
            }
        });
        let reduced = minimizer.minimize(&input).unwrap();
        assert!(reduced.prefix.len() <= input.prefix.len());
        assert!(reduced.main.len() <= input.main.len());
        assert!(reduced.suffix.len() <= input.suffix.len());
        assert_eq!(reduced.interrupts.len(), reduced.main_inst_count());
    }
}

#[test]
fn aborting_probe_stops_the_region_quietly() {
    let (mut mutator, input) = mutator_with_input(6, 25);
    let mut minimizer = Minimizer::new(&mut mutator, |_: &SimInput, _: &[u64]| Probe::Aborted);
    let reduced = minimizer.minimize(&input).unwrap();
    assert_eq!(reduced.main.len(), input.main.len());
}

#[test]
fn skipped_probes_do_not_accept_reductions() {
    let (mut mutator, input) = mutator_with_input(6, 26);
    let mut minimizer = Minimizer::new(&mut mutator, |_: &SimInput, _: &[u64]| Probe::Skipped);
    let reduced = minimizer.minimize(&input).unwrap();
    assert_eq!(reduced.main.len(), input.main.len());
}

#[test]
fn empty_regions_are_skipped() {
    let (mut mutator, mut input) = mutator_with_input(3, 27);
    input.prefix.clear();
    input.suffix.clear();
    let mut minimizer = Minimizer::new(&mut mutator, |_: &SimInput, _: &[u64]| Probe::NotReproduced);
    let reduced = minimizer.minimize(&input).unwrap();
    assert!(reduced.prefix.is_empty());
    assert_eq!(reduced.main.len(), 3);
}

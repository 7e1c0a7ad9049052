use super::*;

fn small_mutator() -> Mutator {
    let mut mutator = Mutator::new("RV64G", 20, 8, false, 7);
    mutator.num_prefix = 2;
    mutator.num_main = 6;
    mutator.num_suffix = 2;
    mutator
}

fn assert_labels_contiguous(words: &[Word]) {
    for (expected, word) in words.iter().enumerate() {
        assert_eq!(word.label, expected, "labels not contiguous: {:?}",
                   words.iter().map(|w| w.label).collect::<Vec<_>>());
    }
}

fn assert_forward_progress(words: &[Word]) {
    let max_label = words.len();
    for word in words {
        for target in word.forward_targets() {
            assert!(
                target > word.label && target <= max_label,
                "label {} references {} (region length {})",
                word.label,
                target,
                max_label
            );
        }
    }
}

#[test]
fn generation_produces_configured_region_sizes() {
    let mut mutator = small_mutator();
    let (input, data) = mutator.next(false).unwrap();
    assert_eq!(input.prefix.len(), 2);
    assert_eq!(input.main.len(), 6);
    assert_eq!(input.suffix.len(), 2);
    assert_eq!(input.interrupts.len(), input.main_inst_count());
    assert!(input.interrupts.iter().all(|&mask| mask == 0));
    assert_eq!(data.len(), DATA_WORDS_PER_SECTION * NUM_DATA_SECTIONS);
}

#[test]
fn generation_with_empty_main_region() {
    let mut mutator = small_mutator();
    mutator.num_main = 0;
    let (input, _) = mutator.next(false).unwrap();
    assert!(input.main.is_empty());
    assert!(input.interrupts.is_empty());
}

#[test]
fn interrupt_assertion_sets_exactly_one_cause() {
    let mut mutator = small_mutator();
    let (input, _) = mutator.next(true).unwrap();
    let asserted: Vec<(usize, u8)> = input
        .interrupts
        .iter()
        .enumerate()
        .filter(|(_, &mask)| mask != 0)
        .map(|(i, &mask)| (i, mask))
        .collect();
    assert_eq!(asserted.len(), 1);
    let (slot, mask) = asserted[0];
    assert!(slot < 10);
    assert!(mask >= 0x1 && mask <= 0xf);
}

#[test]
fn phase_forced_to_generation_early_or_unguided() {
    let mut mutator = small_mutator();
    // Corpus is empty: every choice collapses to Generation.
    for it in 0..10 {
        mutator.update_phase(it);
        assert_eq!(mutator.phase(), Phase::Generation);
    }

    let mut unguided = Mutator::new("RV64G", 20, 8, true, 7);
    unguided.num_main = 4;
    for _ in 0..3 {
        let (input, _) = unguided.next(false).unwrap();
        unguided.add_to_corpus(input);
    }
    for it in 0..200 {
        unguided.update_phase(it);
        assert_eq!(unguided.phase(), Phase::Generation);
    }
}

#[test]
fn phase_machine_reaches_mutation_and_merge_when_guided() {
    let mut mutator = small_mutator();
    for _ in 0..3 {
        let (input, _) = mutator.next(false).unwrap();
        mutator.add_to_corpus(input);
    }
    let mut seen = std::collections::HashSet::new();
    for _ in 0..300 {
        // Past the warm-up threshold (corpus_size / 10 = 2).
        mutator.update_phase(100);
        seen.insert(mutator.phase());
    }
    assert!(seen.contains(&Phase::Generation));
    assert!(seen.contains(&Phase::Mutation));
    assert!(seen.contains(&Phase::Merge));
}

#[test]
fn mutation_keeps_labels_contiguous_and_forward() {
    let mut mutator = small_mutator();
    for _ in 0..4 {
        let (input, _) = mutator.next(false).unwrap();
        mutator.add_to_corpus(input);
    }
    mutator.phase = Phase::Mutation;
    for _ in 0..20 {
        let (input, _) = mutator.next(false).unwrap();
        for region in Region::all() {
            assert_labels_contiguous(input.region(region));
            assert_forward_progress(input.region(region));
        }
        assert_eq!(input.interrupts.len(), input.main_inst_count());
    }
}

#[test]
fn merge_keeps_labels_contiguous_and_forward() {
    let mut mutator = small_mutator();
    for _ in 0..4 {
        let (input, _) = mutator.next(false).unwrap();
        mutator.add_to_corpus(input);
    }
    mutator.phase = Phase::Merge;
    for _ in 0..20 {
        let (input, _) = mutator.next(false).unwrap();
        for region in Region::all() {
            assert_labels_contiguous(input.region(region));
            assert_forward_progress(input.region(region));
        }
        assert!(input.main.len() <= MAX_MAIN_WORDS);
    }
}

#[test]
fn mutation_respects_region_budgets() {
    let mut mutator = small_mutator();
    for _ in 0..4 {
        let (input, _) = mutator.next(false).unwrap();
        mutator.add_to_corpus(input);
    }
    mutator.phase = Phase::Mutation;
    for _ in 0..20 {
        let (input, _) = mutator.next(false).unwrap();
        assert!(input.prefix.len() <= mutator.num_prefix);
        assert!(input.suffix.len() <= mutator.num_suffix);
        assert!(input.main.len() <= MAX_MAIN_WORDS);
    }
}

#[test]
fn mutated_inputs_inherit_parent_seed_and_template() {
    let mut mutator = small_mutator();
    let (parent, _) = mutator.next(false).unwrap();
    let parent_seed = parent.data_seed;
    let parent_template = parent.template;
    mutator.add_to_corpus(parent);

    mutator.phase = Phase::Mutation;
    let (child, _) = mutator.next(false).unwrap();
    assert_eq!(child.data_seed, parent_seed);
    assert_eq!(child.template, parent_template);
}

#[test]
fn make_nop_replaces_masked_words_and_zeroes_their_interrupts() {
    let mut mutator = small_mutator();
    let (input, _) = mutator.next(true).unwrap();

    let mask: Vec<bool> = (0..input.main.len()).map(|i| i % 2 == 0).collect();
    let (reduced, _) = mutator.make_nop(&input, &mask, Region::Main).unwrap();

    assert_eq!(reduced.main.len(), input.main.len());
    for (word, &masked) in reduced.main.iter().zip(&mask) {
        assert_eq!(word.is_nop(), masked);
    }
    assert_eq!(reduced.interrupts.len(), reduced.main_inst_count());
}

#[test]
fn make_nop_rejects_wrong_mask_length() {
    let mut mutator = small_mutator();
    let (input, _) = mutator.next(false).unwrap();
    let err = mutator.make_nop(&input, &[true], Region::Main).unwrap_err();
    assert!(err.contains("mask length"));
}

#[test]
fn delete_nop_compacts_and_renumbers() {
    let mut mutator = small_mutator();
    let (input, _) = mutator.next(false).unwrap();
    let original_main = input.main.len();

    let mask: Vec<bool> = (0..original_main).map(|i| i < 2).collect();
    let (noped, _) = mutator.make_nop(&input, &mask, Region::Main).unwrap();
    let (compacted, _) = mutator.delete_nop(&noped).unwrap();

    assert_eq!(compacted.main.len(), original_main - 2);
    assert_labels_contiguous(&compacted.main);
    assert_forward_progress(&compacted.main);
    assert_eq!(compacted.interrupts.len(), compacted.main_inst_count());
}

//! Sequence mutator: owns the corpus, the random-data pool and the
//! generation/mutation/merge phase machine, and produces the
//! [`SimInput`]s the fuzz loop feeds to the backends.

use crate::generator::InstGenerator;
use crate::isa::{DATA_WORDS_PER_SECTION, NUM_DATA_SECTIONS};
use crate::word::{Region, Word};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

pub mod sim_input;
pub use sim_input::{ParsedInput, SimInput, TemplateId, TEMPLATE_COUNT};

/// Mutation phase the next input is produced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Generation,
    Mutation,
    Merge,
}

struct SeedEntry {
    id: usize,
    data: Vec<u64>,
    refs: usize,
}

/// Fixed-capacity ring of named random-data blocks.
///
/// Allocation evicts the oldest entry whose reference count is zero; a
/// seed still referenced by a live corpus entry is never dropped. If
/// every slot is pinned the ring grows past its capacity transiently
/// instead of corrupting a live input.
pub struct DataPool {
    capacity: usize,
    entries: Vec<SeedEntry>,
    next_id: usize,
}

impl DataPool {
    pub fn new(capacity: usize) -> Self {
        DataPool {
            capacity,
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn fresh_data(rng: &mut StdRng) -> Vec<u64> {
        (0..DATA_WORDS_PER_SECTION * NUM_DATA_SECTIONS)
            .map(|_| rng.random())
            .collect()
    }

    pub fn alloc(&mut self, data: Vec<u64>) -> usize {
        if self.entries.len() >= self.capacity {
            if let Some(pos) = self.entries.iter().position(|e| e.refs == 0) {
                self.entries.remove(pos);
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(SeedEntry { id, data, refs: 0 });
        id
    }

    pub fn clone_data(&self, id: usize) -> Option<Vec<u64>> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.data.clone())
    }

    /// Mark a seed as freshly used, protecting it from the next eviction
    /// sweep for as long as possible.
    pub fn touch(&mut self, id: usize) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            let entry = self.entries.remove(pos);
            self.entries.push(entry);
        }
    }

    pub fn retain(&mut self, id: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.refs += 1;
        }
    }

    pub fn release(&mut self, id: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }
}

/// Default region sizes of a freshly generated input.
const DEFAULT_NUM_PREFIX: usize = 3;
const DEFAULT_NUM_MAIN: usize = 100;
const DEFAULT_NUM_SUFFIX: usize = 5;
/// Hard ceiling the growing main region saturates at.
const MAX_MAIN_WORDS: usize = 200;

/// Iterations asserting an interrupt pick the cause slot among this many
/// leading main-region instructions.
const INTR_WINDOW: usize = 10;

pub struct Mutator {
    corpus_size: usize,
    no_guide: bool,
    pub num_prefix: usize,
    pub num_main: usize,
    pub num_suffix: usize,
    max_main: usize,
    corpus: VecDeque<SimInput>,
    phase: Phase,
    pool: DataPool,
    generator: InstGenerator,
    rng: StdRng,
}

impl Mutator {
    pub fn new(isa: &str, corpus_size: usize, max_data_seeds: usize, no_guide: bool, seed: u64) -> Self {
        Mutator {
            corpus_size,
            no_guide,
            num_prefix: DEFAULT_NUM_PREFIX,
            num_main: DEFAULT_NUM_MAIN,
            num_suffix: DEFAULT_NUM_SUFFIX,
            max_main: MAX_MAIN_WORDS,
            corpus: VecDeque::new(),
            phase: Phase::Generation,
            pool: DataPool::new(max_data_seeds),
            generator: InstGenerator::new(isa, seed.wrapping_add(1)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn corpus_len(&self) -> usize {
        self.corpus.len()
    }

    pub fn pool(&self) -> &DataPool {
        &self.pool
    }

    /// Produce the next input under the current phase, together with a
    /// private copy of its backing random data.
    pub fn next(&mut self, assert_intr: bool) -> Result<(SimInput, Vec<u64>), String> {
        self.generator.reset();

        let mut data_seed = None;
        let mut template = None;
        let (mut prefix, mut main, mut suffix);

        match self.phase {
            Phase::Generation => {
                prefix = Vec::with_capacity(self.num_prefix);
                main = Vec::with_capacity(self.num_main);
                suffix = Vec::with_capacity(self.num_suffix);
                for _ in 0..self.num_prefix {
                    prefix.push(self.generator.gen_word(Region::Prefix));
                }
                for _ in 0..self.num_main {
                    main.push(self.generator.gen_word(Region::Main));
                }
                for _ in 0..self.num_suffix {
                    suffix.push(self.generator.gen_word(Region::Suffix));
                }
            }
            Phase::Mutation => {
                let parent = &self.corpus[self.rng.random_range(0..self.corpus.len())];
                let seed_prefix = parent.prefix.clone();
                let seed_main = parent.main.clone();
                let seed_suffix = parent.suffix.clone();
                data_seed = Some(parent.data_seed);
                template = Some(parent.template);

                prefix = self.mutate_words(seed_prefix, Region::Prefix, self.num_prefix);
                main = self.mutate_words(seed_main, Region::Main, self.max_main);
                suffix = self.mutate_words(seed_suffix, Region::Suffix, self.num_suffix);
            }
            Phase::Merge => {
                let first = &self.corpus[self.rng.random_range(0..self.corpus.len())];
                let second = &self.corpus[self.rng.random_range(0..self.corpus.len())];

                let seed_prefix = first.prefix.clone();
                let seed_suffix = first.suffix.clone();
                data_seed = Some(first.data_seed);
                template = Some(first.template);

                let splice = self
                    .rng
                    .random_range(0..=first.main.len().min(second.main.len()));
                let mut seed_main: Vec<Word> = first.main[..splice].to_vec();
                seed_main.extend_from_slice(&second.main[splice..]);

                prefix = self.mutate_words(seed_prefix, Region::Prefix, self.num_prefix);
                main = self.mutate_words(seed_main, Region::Main, self.max_main);
                suffix = self.mutate_words(seed_suffix, Region::Suffix, self.num_suffix);
            }
        }

        let prefix_max = prefix.len();
        for word in &mut prefix {
            self.generator.populate_word(word, prefix_max)?;
        }
        let main_max = main.len();
        for word in &mut main {
            self.generator.populate_word(word, main_max)?;
        }
        let suffix_max = suffix.len();
        for word in &mut suffix {
            self.generator.populate_word(word, suffix_max)?;
        }

        let inst_count: usize = main.iter().map(Word::len_insts).sum();
        let mut interrupts = vec![0u8; inst_count];
        if assert_intr && inst_count > 0 {
            let slot = self.rng.random_range(0..inst_count.min(INTR_WINDOW));
            interrupts[slot] = self.rng.random_range(0x1..=0xf);
        }

        let data_seed = match data_seed {
            Some(seed) => {
                self.pool.touch(seed);
                seed
            }
            None => {
                let data = DataPool::fresh_data(&mut self.rng);
                self.pool.alloc(data)
            }
        };
        let template = template
            .unwrap_or_else(|| TemplateId::from_index(self.rng.random_range(0..TEMPLATE_COUNT)));

        let input = SimInput::new(prefix, main, suffix, interrupts, data_seed, template);
        let data = self
            .pool
            .clone_data(data_seed)
            .ok_or_else(|| format!("data seed {} missing from pool", data_seed))?;

        Ok((input, data))
    }

    /// Per-word transform: keep, keep-and-append-fresh, or drop; then
    /// truncate to the region budget, renumber and repair references.
    fn mutate_words(&mut self, seed_words: Vec<Word>, region: Region, max_num: usize) -> Vec<Word> {
        let mut words = Vec::with_capacity(seed_words.len());
        for word in seed_words {
            let roll: f64 = self.rng.random();
            if roll < 0.5 {
                words.push(word);
            } else if roll < 0.75 {
                words.push(word);
                words.push(self.generator.gen_word(region));
            }
        }
        words.truncate(max_num);
        self.reset_labels(&mut words);
        words
    }

    /// Renumber a word list to contiguous `0..N` and repair every forward
    /// reference against the new numbering.
    pub fn reset_labels(&mut self, words: &mut Vec<Word>) {
        let mut label_map = HashMap::new();
        for (n, word) in words.iter_mut().enumerate() {
            if let Some((old, new)) = word.reset_label(n) {
                label_map.insert(old, new);
            }
        }
        let max_label = words.len();
        for word in words.iter_mut() {
            word.repair_refs(&label_map, max_label, &mut self.rng);
        }
    }

    /// Advance the phase machine for iteration `it`.
    pub fn update_phase(&mut self, it: usize) {
        if it < self.corpus_size / 10 || self.no_guide || self.corpus.is_empty() {
            self.phase = Phase::Generation;
            return;
        }
        let roll: f64 = self.rng.random();
        self.phase = if roll < 0.10 {
            Phase::Generation
        } else if roll < 0.55 {
            Phase::Mutation
        } else {
            Phase::Merge
        };
    }

    /// Record a coverage-producing input. The corpus is a bounded FIFO;
    /// the evicted head releases its data-seed reference. Each accepted
    /// input also lets freshly generated programs grow one word longer,
    /// up to the hard ceiling.
    pub fn add_to_corpus(&mut self, input: SimInput) {
        self.pool.retain(input.data_seed);
        self.corpus.push_back(input);
        self.num_main = (self.num_main + 1).min(self.max_main);
        if self.corpus.len() > self.corpus_size {
            if let Some(evicted) = self.corpus.pop_front() {
                self.pool.release(evicted.data_seed);
            }
        }
    }

    /// Re-home a parsed on-disk input in this mutator's data pool. The
    /// seed is pinned so later allocations cannot evict it while the
    /// caller still replays the input.
    pub fn import_parsed(&mut self, parsed: ParsedInput) -> Result<(SimInput, Vec<u64>, bool), String> {
        let main_insts: usize = parsed.main.iter().map(Word::len_insts).sum();
        if parsed.interrupts.len() != main_insts {
            return Err(format!(
                "interrupt mask covers {} lines but main region has {}",
                parsed.interrupts.len(),
                main_insts
            ));
        }

        let assert_intr = parsed.interrupts.iter().any(|&mask| mask != 0);
        let data = if parsed.data.is_empty() {
            DataPool::fresh_data(&mut self.rng)
        } else {
            parsed.data
        };
        let seed = self.pool.alloc(data.clone());
        self.pool.retain(seed);

        let input = SimInput::new(
            parsed.prefix,
            parsed.main,
            parsed.suffix,
            parsed.interrupts,
            seed,
            parsed.template,
        );
        Ok((input, data, assert_intr))
    }

    /// Unpin a seed pinned by [`Mutator::import_parsed`] once its input is
    /// no longer replayed.
    pub fn release_seed(&mut self, seed: usize) {
        self.pool.release(seed);
    }

    /// Best-effort catch-up on corpus files published by sibling workers.
    /// Unparsable files are skipped and logged, never fatal.
    pub fn update_corpus(&mut self, corpus_dir: &Path, update_num: usize) -> usize {
        let mut ids: Vec<usize> = match std::fs::read_dir(corpus_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    name.strip_prefix("id_")?.strip_suffix(".si")?.parse().ok()
                })
                .collect(),
            Err(_) => return 0,
        };
        ids.sort_unstable();

        let start = ids.len().saturating_sub(update_num);
        let mut imported = 0;
        for id in &ids[start..] {
            let path = corpus_dir.join(format!("id_{}.si", id));
            let parsed = match SimInput::load(&path) {
                Ok(parsed) => parsed,
                Err(err) => {
                    log::warn!("skipping corpus file {}: {}", path.display(), err);
                    continue;
                }
            };
            match self.import_parsed(parsed) {
                Ok((input, _, _)) => {
                    self.add_to_corpus(input);
                    imported += 1;
                }
                Err(err) => {
                    log::warn!("skipping corpus file {}: {}", path.display(), err);
                }
            }
        }
        imported
    }

    /// Replace the masked words of one region with single-`nop` words,
    /// keeping the interrupt mask aligned with the surviving lines.
    pub fn make_nop(
        &mut self,
        input: &SimInput,
        nop_mask: &[bool],
        region: Region,
    ) -> Result<(SimInput, Vec<u64>), String> {
        let target = input.region(region);
        if target.len() != nop_mask.len() {
            return Err(format!(
                "nop mask length {} does not match region length {}",
                nop_mask.len(),
                target.len()
            ));
        }

        let mut replaced = Vec::with_capacity(target.len());
        for (word, &masked) in target.iter().zip(nop_mask) {
            if masked {
                replaced.push(Word::nop(word.label, region));
            } else {
                replaced.push(word.clone());
            }
        }

        let mut reduced = input.clone();
        if region == Region::Main {
            let mut interrupts = Vec::new();
            let mut cursor = 0;
            for (word, &masked) in target.iter().zip(nop_mask) {
                let span = word.len_insts();
                if masked {
                    interrupts.push(0);
                } else {
                    interrupts.extend_from_slice(&input.interrupts[cursor..cursor + span]);
                }
                cursor += span;
            }
            reduced.interrupts = interrupts;
        }
        *reduced.region_mut(region) = replaced;

        let data = self
            .pool
            .clone_data(input.data_seed)
            .ok_or_else(|| format!("data seed {} missing from pool", input.data_seed))?;
        Ok((reduced, data))
    }

    /// Drop every `nop` word, renumber all three regions and compact the
    /// interrupt mask accordingly.
    pub fn delete_nop(&mut self, input: &SimInput) -> Result<(SimInput, Vec<u64>), String> {
        let mut reduced = input.clone();

        for region in Region::all() {
            let mut kept = Vec::new();
            if region == Region::Main {
                let mut interrupts = Vec::new();
                let mut cursor = 0;
                for word in &input.main {
                    let span = word.len_insts();
                    if !word.is_nop() {
                        kept.push(word.clone());
                        interrupts.extend_from_slice(&input.interrupts[cursor..cursor + span]);
                    }
                    cursor += span;
                }
                reduced.interrupts = interrupts;
            } else {
                kept = input.region(region).iter().filter(|w| !w.is_nop()).cloned().collect();
            }
            self.reset_labels(&mut kept);
            *reduced.region_mut(region) = kept;
        }

        let data = self
            .pool
            .clone_data(input.data_seed)
            .ok_or_else(|| format!("data seed {} missing from pool", input.data_seed))?;
        Ok((reduced, data))
    }
}

#[cfg(test)]
mod tests_mutation;

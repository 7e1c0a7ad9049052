//! Delta-debugging minimizer: shrinks a mismatch-producing input to a
//! smaller reproducer by replacing word chunks with `nop`s.
//!
//! The search is a monotone mask search. Each region runs `ceil(log2 L)`
//! rounds of progressively finer chunk replacement; an accepted chunk is
//! OR-ed into the mask permanently, so the mask only ever grows and the
//! search always terminates with a subset-reproducer of the original.

use crate::mutator::{Mutator, SimInput};
use crate::word::Region;

/// What one replay probe of a candidate reduction concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The mismatch still reproduces; keep the reduction.
    Reproduced,
    /// The candidate behaves correctly; discard the reduction.
    NotReproduced,
    /// The probe could not be evaluated (ISA timeout); skip it.
    Skipped,
    /// The probe cannot continue (compile failure); abort this region.
    Aborted,
}

/// Replays a candidate input against both backends and reports whether
/// the original mismatch is still there.
pub trait MinimizeOracle {
    fn probe(&mut self, input: &SimInput, data: &[u64]) -> Probe;
}

impl<F> MinimizeOracle for F
where
    F: FnMut(&SimInput, &[u64]) -> Probe,
{
    fn probe(&mut self, input: &SimInput, data: &[u64]) -> Probe {
        self(input, data)
    }
}

pub struct Minimizer<'a, O: MinimizeOracle> {
    mutator: &'a mut Mutator,
    oracle: O,
}

impl<'a, O: MinimizeOracle> Minimizer<'a, O> {
    pub fn new(mutator: &'a mut Mutator, oracle: O) -> Self {
        Minimizer { mutator, oracle }
    }

    /// Reduce `input` region by region, then compact the surviving
    /// program by deleting the `nop` filler and renumbering.
    pub fn minimize(&mut self, input: &SimInput) -> Result<SimInput, String> {
        let mut reduced = input.clone();
        for region in Region::all() {
            reduced = self.minimize_region(reduced, region)?;
        }
        let (compacted, _) = self.mutator.delete_nop(&reduced)?;
        Ok(compacted)
    }

    fn minimize_region(&mut self, input: SimInput, region: Region) -> Result<SimInput, String> {
        let len = input.region(region).len();
        if len == 0 {
            return Ok(input);
        }

        let mut best = input;
        let mut accepted = vec![false; len];
        // ceil(log2 len): the number of halving rounds needed to reach
        // single-word chunks.
        let rounds = u32::BITS - (len as u32).leading_zeros() - u32::from(len.is_power_of_two());

        let mut tries = 0;
        for round in 0..rounds {
            let chunk = len / (1usize << (round + 1)).min(len);
            let num_tests = len / chunk;
            let rest = chunk + len % chunk;

            for test in 0..num_tests {
                let mut candidate = vec![false; len];
                let start = chunk * test;
                let span = if test == num_tests - 1 { rest } else { chunk };
                for slot in candidate.iter_mut().skip(start).take(span) {
                    *slot = true;
                }
                for (slot, &kept) in candidate.iter_mut().zip(&accepted) {
                    *slot |= kept;
                }
                if candidate == accepted {
                    continue;
                }

                let (reduced, data) = self.mutator.make_nop(&best, &candidate, region)?;
                match self.oracle.probe(&reduced, &data) {
                    Probe::Reproduced => {
                        best = reduced;
                        accepted = candidate;
                        log::info!("iter [{}], minimized", tries);
                        tries += 1;
                    }
                    Probe::NotReproduced | Probe::Skipped => {}
                    Probe::Aborted => return Ok(best),
                }
            }
        }

        Ok(best)
    }
}

#[cfg(test)]
mod tests_minimizer;

//! Instruction generator: turns the enabled opcode pool into Words that
//! are compilable and guaranteed to make forward progress.
//!
//! Every structural hazard is handled at Word-construction time: memory
//! opcodes get an address-materialization prefix bound to a reserved data
//! section, trap returns point their exception PC at a forward label
//! first, and control-flow symbols are only ever drawn from labels
//! strictly after the referencing Word.

use crate::isa::{
    self, OpClass, OpcodeSpec, CSR_NAMES, DATA_LABELS_PER_SECTION, NUM_DATA_SECTIONS, PT_SYMBOLS,
};
use crate::word::{OperandValue, Region, SymbolRef, Word, WordKind};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::collections::HashMap;

/// Probability of reusing an already-used register or immediate, which
/// biases sequences toward read-after-write hazards.
const REUSE_THRESHOLD: f64 = 0.2;
/// Probability of emitting a boundary immediate (0 or all-ones).
const BOUNDARY_THRESHOLD: f64 = 0.2;
/// Probability of XORing a materialized address with a high-bit mask.
const ADDR_MASK_PROB: f64 = 0.1;
/// Probability that a memory read targets a forward code label instead
/// of a data section.
const CODE_READ_PROB: f64 = 0.2;

/// Integer register range prefix-region operands are confined to.
const PREFIX_XREG_RANGE: (usize, usize) = (10, 15);
const FULL_XREG_RANGE: (usize, usize) = (0, 32);

pub struct InstGenerator {
    pool: Vec<&'static OpcodeSpec>,
    prefix_pool: Vec<&'static OpcodeSpec>,
    next_label: [usize; 3],
    used_xregs: Vec<usize>,
    used_fregs: Vec<usize>,
    used_imms: Vec<u64>,
    rng: StdRng,
}

impl InstGenerator {
    pub fn new(isa_name: &str, seed: u64) -> Self {
        InstGenerator {
            pool: isa::profile(isa_name),
            prefix_pool: isa::prefix_profile(),
            next_label: [0; 3],
            used_xregs: Vec::new(),
            used_fregs: Vec::new(),
            used_imms: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Clear per-input state: label counters and operand-reuse sets.
    pub fn reset(&mut self) {
        self.next_label = [0; 3];
        self.used_xregs.clear();
        self.used_fregs.clear();
        self.used_imms.clear();
    }

    fn region_index(region: Region) -> usize {
        match region {
            Region::Prefix => 0,
            Region::Main => 1,
            Region::Suffix => 2,
        }
    }

    /// Synthesize one unresolved Word for `region`, consuming the next
    /// label number.
    pub fn gen_word(&mut self, region: Region) -> Word {
        let spec = if region == Region::Prefix {
            self.prefix_pool[self.rng.random_range(0..self.prefix_pool.len())]
        } else {
            self.pool[self.rng.random_range(0..self.pool.len())]
        };

        let label = self.next_label[Self::region_index(region)];
        self.next_label[Self::region_index(region)] += 1;

        self.build_word(spec, label, region)
    }

    fn build_word(&mut self, spec: &'static OpcodeSpec, label: usize, region: Region) -> Word {
        let syntax = spec.syntax.to_string();
        let mut xregs: Vec<String> = spec.xregs.iter().map(|s| s.to_string()).collect();
        let fregs: Vec<String> = spec.fregs.iter().map(|s| s.to_string()).collect();
        let mut imms: Vec<(String, u64)> =
            spec.imms.iter().map(|(n, a)| (n.to_string(), *a)).collect();
        let mut syms: Vec<String> = spec.symbols.iter().map(|s| s.to_string()).collect();

        let (kind, mut templates) = match spec.class {
            OpClass::Jal => (WordKind::Jump, vec![syntax]),
            OpClass::Jalr => {
                syms.push("symbol".to_string());
                (WordKind::Jump, vec!["la xreg1, symbol".to_string(), syntax])
            }
            OpClass::Branch => (WordKind::Branch, vec![syntax]),
            OpClass::TrapRet => {
                let epc = match spec.name {
                    "mret" => "mepc",
                    "sret" => "sepc",
                    _ => "uepc",
                };
                xregs.push("xreg0".to_string());
                syms.push("symbol".to_string());
                (
                    WordKind::Return,
                    vec![
                        "la xreg0, symbol".to_string(),
                        format!("csrrw zero, {}, xreg0", epc),
                        syntax,
                    ],
                )
            }
            OpClass::Load => {
                syms.push("symbol".to_string());
                let mut insts = vec!["la xreg1, symbol".to_string()];
                self.maybe_mask_address(&mut insts, &mut xregs);
                insts.push(syntax);
                (WordKind::MemRead, insts)
            }
            OpClass::Store => {
                syms.push("symbol".to_string());
                let mut insts = vec!["la xreg1, symbol".to_string()];
                self.maybe_mask_address(&mut insts, &mut xregs);
                insts.push(syntax);
                (WordKind::MemWrite, insts)
            }
            OpClass::Atomic => {
                syms.push("symbol".to_string());
                let align = if isa::is_rv64_op(spec.name) { 8 } else { 4 };
                imms.push(("imm6".to_string(), align));
                let mut insts = vec![
                    "la xreg1, symbol".to_string(),
                    "addi xreg1, xreg1, imm6".to_string(),
                ];
                self.maybe_mask_address(&mut insts, &mut xregs);
                insts.push(syntax);
                (WordKind::MemWrite, insts)
            }
            OpClass::CsrReg => {
                let csr = CSR_NAMES[self.rng.random_range(0..CSR_NAMES.len())];
                if csr.starts_with("pmpaddr") {
                    // A PMP address write is an address computation in
                    // disguise; treat it as a memory read so its symbol
                    // stays inside the reserved data range.
                    syms.push("symbol".to_string());
                    (
                        WordKind::MemRead,
                        vec![
                            "la xreg1, symbol".to_string(),
                            "srai xreg1, xreg1, 1".to_string(),
                            syntax.replace("{csr}", csr),
                        ],
                    )
                } else {
                    let mut insts = vec!["xor xreg1, xreg1, xreg1".to_string()];
                    for i in 0..self.rng.random_range(0..=3usize) {
                        let set_bits = if self.rng.random_bool(0.5) { 1 } else { 3 };
                        let offset = self.rng.random_range(0..32);
                        let reg = format!("xreg{}", i + 2);
                        insts.push(format!("addi {}, zero, {}", reg, set_bits));
                        insts.push(format!("slli {}, {}, {}", reg, reg, offset));
                        insts.push(format!("add xreg1, xreg1, {}", reg));
                        xregs.push(reg);
                    }
                    insts.push(syntax.replace("{csr}", csr));
                    (WordKind::Csr, insts)
                }
            }
            OpClass::CsrImm => {
                let csr = CSR_NAMES[self.rng.random_range(0..CSR_NAMES.len())];
                (WordKind::Csr, vec![syntax.replace("{csr}", csr)])
            }
            OpClass::Sfence => {
                let pt = PT_SYMBOLS[self.rng.random_range(0..PT_SYMBOLS.len())];
                imms.push(("uimm1".to_string(), 1));
                imms.push(("uimm6".to_string(), 8));
                (
                    WordKind::Plain,
                    vec![
                        "li xreg0, uimm1".to_string(),
                        format!("la xreg1, {}", pt),
                        "addi xreg1, xreg1, uimm6".to_string(),
                        syntax,
                    ],
                )
            }
            OpClass::Float => (WordKind::Plain, vec![syntax]),
            OpClass::Plain => (WordKind::Plain, vec![syntax]),
        };

        // Rounding mode stays pinned; mode fuzzing belongs to the CSR side.
        for template in &mut templates {
            if template.contains("{rm}") {
                *template = template.replace("{rm}", "rne");
            }
        }

        let mut word = Word::new(label, region, kind, templates);
        word.xreg_slots = xregs;
        word.freg_slots = fregs;
        word.imm_slots = imms;
        word.sym_slots = syms;
        word
    }

    fn maybe_mask_address(&mut self, insts: &mut Vec<String>, xregs: &mut Vec<String>) {
        if self.rng.random_bool(ADDR_MASK_PROB) {
            insts.push("lui xreg2, 0xffe00".to_string());
            insts.push("xor xreg1, xreg1, xreg2".to_string());
            if !xregs.iter().any(|r| r == "xreg2") {
                xregs.push("xreg2".to_string());
            }
        }
    }

    /// Bind every slot of `word` and freeze its rendered text. Forward
    /// symbols are drawn from `word.label + 1 ..= max_label`.
    pub fn populate_word(&mut self, word: &mut Word, max_label: usize) -> Result<(), String> {
        if word.is_resolved() {
            return Ok(());
        }

        let (range, no_zero) = if word.kind == WordKind::Plain {
            (FULL_XREG_RANGE, false)
        } else if word.region == Region::Prefix {
            (PREFIX_XREG_RANGE, true)
        } else {
            (FULL_XREG_RANGE, true)
        };

        let mut bindings: HashMap<String, OperandValue> = HashMap::new();
        for slot in word.xreg_slots.clone() {
            let value = self.pick_xreg(range, no_zero);
            bindings.insert(slot, OperandValue::Text(value));
        }
        for slot in word.freg_slots.clone() {
            let value = self.pick_freg();
            bindings.insert(slot, OperandValue::Text(value));
        }
        for (slot, align) in word.imm_slots.clone() {
            let value = self.pick_imm(&slot, align)?;
            bindings.insert(slot, OperandValue::Text(value));
        }
        for slot in word.sym_slots.clone() {
            let value = self.pick_symbol(word.kind, word.label, max_label);
            bindings.insert(slot, OperandValue::Symbol(value));
        }

        word.populate(&bindings)
    }

    fn pick_xreg(&mut self, range: (usize, usize), no_zero: bool) -> String {
        let full = range == FULL_XREG_RANGE;
        let mut num = if full && !self.used_xregs.is_empty() && self.rng.random_bool(REUSE_THRESHOLD)
        {
            self.used_xregs[self.rng.random_range(0..self.used_xregs.len())]
        } else {
            let fresh = self.rng.random_range(range.0..range.1);
            if !self.used_xregs.contains(&fresh) {
                self.used_xregs.push(fresh);
            }
            fresh
        };
        if no_zero && num == 0 {
            num = self.rng.random_range(1..32);
        }
        format!("x{}", num)
    }

    fn pick_freg(&mut self) -> String {
        let num = if !self.used_fregs.is_empty() && self.rng.random_bool(REUSE_THRESHOLD) {
            self.used_fregs[self.rng.random_range(0..self.used_fregs.len())]
        } else {
            let fresh = self.rng.random_range(0..32);
            if !self.used_fregs.contains(&fresh) {
                self.used_fregs.push(fresh);
            }
            fresh
        };
        format!("f{}", num)
    }

    /// Immediates are masked to both the slot's bit width and its
    /// alignment before emission, so the rendered value always assembles.
    fn pick_imm(&mut self, name: &str, align: u64) -> Result<String, String> {
        debug_assert!(align.is_power_of_two());
        let (sign, width) = if let Some(digits) = name.strip_prefix("uimm") {
            let width: u32 = digits
                .parse()
                .map_err(|_| format!("bad immediate slot name {}", name))?;
            ("", width)
        } else if let Some(digits) = name.strip_prefix("imm") {
            let width: u32 = digits
                .parse()
                .map_err(|_| format!("bad immediate slot name {}", name))?;
            let sign = if self.rng.random_bool(0.5) { "-" } else { "" };
            (sign, width - 1)
        } else {
            return Err(format!("bad immediate slot name {}", name));
        };

        let mask = ((1u64 << width) - 1) & !(align - 1);

        let roll: f64 = self.rng.random();
        let value = if roll < REUSE_THRESHOLD && !self.used_imms.is_empty() {
            self.used_imms[self.rng.random_range(0..self.used_imms.len())]
        } else if roll < REUSE_THRESHOLD + BOUNDARY_THRESHOLD {
            if self.rng.random_bool(0.5) {
                0x0
            } else {
                0xffff_ffff
            }
        } else {
            let fresh = self.rng.random_range(0..=mask);
            if !self.used_imms.contains(&fresh) {
                self.used_imms.push(fresh);
            }
            fresh
        };

        Ok(format!("{}{}", sign, mask & value))
    }

    fn pick_symbol(&mut self, kind: WordKind, label: usize, max_label: usize) -> SymbolRef {
        let data = |rng: &mut StdRng| SymbolRef::Data {
            section: rng.random_range(0..NUM_DATA_SECTIONS),
            entry: rng.random_range(0..DATA_LABELS_PER_SECTION),
        };

        match kind {
            WordKind::MemWrite => data(&mut self.rng),
            WordKind::MemRead => {
                if self.rng.random_bool(CODE_READ_PROB) {
                    SymbolRef::Forward {
                        label: self.rng.random_range(label + 1..=max_label),
                    }
                } else {
                    data(&mut self.rng)
                }
            }
            _ => SymbolRef::Forward {
                label: self.rng.random_range(label + 1..=max_label),
            },
        }
    }
}

//! The Word model: the mutation-indivisible unit of a test program.
//!
//! A Word is a labeled group of one or more instructions with typed
//! operand slots. The generator builds Words with unresolved slots,
//! binds them, and freezes the result into rendered instruction lines.
//! Symbol operands stay structured after rendering ([`SymbolRef`] next to
//! the text, never a substring to be re-found), so renumbering a sequence
//! and repairing its forward references is an exact rewrite.

use rand::rngs::StdRng;
use rand::RngExt;
use std::collections::HashMap;

/// Which segment of the test program a Word belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Prefix,
    Main,
    Suffix,
}

impl Region {
    /// Label spelling used in rendered assembly: `_p3`, `_l17`, `_s0`.
    pub fn label_tag(self) -> &'static str {
        match self {
            Region::Prefix => "_p",
            Region::Main => "_l",
            Region::Suffix => "_s",
        }
    }

    pub fn all() -> [Region; 3] {
        [Region::Prefix, Region::Main, Region::Suffix]
    }
}

/// Structural behavior of a Word, derived from its opcode's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    Plain,
    Jump,
    Branch,
    Return,
    MemRead,
    MemWrite,
    Csr,
}

impl WordKind {
    /// Kinds whose symbol operand must target a forward in-sequence label.
    pub fn is_control_flow(self) -> bool {
        matches!(self, WordKind::Jump | WordKind::Branch | WordKind::Return)
    }
}

/// A resolved symbol operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolRef {
    /// Interior label of a pre-reserved random-data section: `d_<n>_<k>`.
    Data { section: usize, entry: usize },
    /// Region-local label, strictly greater than the referencing Word's.
    Forward { label: usize },
}

impl SymbolRef {
    pub fn render(self, region: Region) -> String {
        match self {
            SymbolRef::Data { section, entry } => format!("d_{}_{}", section, entry),
            SymbolRef::Forward { label } => format!("{}{}", region.label_tag(), label),
        }
    }
}

/// Value bound to an operand slot during resolution.
#[derive(Debug, Clone)]
pub enum OperandValue {
    Text(String),
    Symbol(SymbolRef),
}

/// One rendered instruction line. The symbol operand, if any, is kept
/// structured so label repair never has to parse the text back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedInst {
    before: String,
    symbol: Option<SymbolRef>,
    after: String,
}

impl RenderedInst {
    pub fn plain(text: impl Into<String>) -> Self {
        RenderedInst {
            before: text.into(),
            symbol: None,
            after: String::new(),
        }
    }

    pub fn with_symbol(before: impl Into<String>, symbol: SymbolRef, after: impl Into<String>) -> Self {
        RenderedInst {
            before: before.into(),
            symbol: Some(symbol),
            after: after.into(),
        }
    }

    pub fn symbol(&self) -> Option<SymbolRef> {
        self.symbol
    }

    pub fn set_symbol(&mut self, symbol: SymbolRef) {
        debug_assert!(self.symbol.is_some());
        self.symbol = Some(symbol);
    }

    /// Final assembly text of this line.
    pub fn text(&self, region: Region) -> String {
        match self.symbol {
            Some(sym) => format!("{}{}{}", self.before, sym.render(region), self.after),
            None => self.before.clone(),
        }
    }
}

/// A labeled, typed group of instruction templates with operand slots.
///
/// `rendered` is valid only once `resolved` is set; every slot must be
/// bound first. Words are value types: mutation always deep-copies, no
/// Word is shared between two live inputs.
#[derive(Debug, Clone)]
pub struct Word {
    pub label: usize,
    pub region: Region,
    pub kind: WordKind,
    pub templates: Vec<String>,
    pub xreg_slots: Vec<String>,
    pub freg_slots: Vec<String>,
    /// (slot name, alignment in bytes)
    pub imm_slots: Vec<(String, u64)>,
    pub sym_slots: Vec<String>,
    resolved: bool,
    rendered: Vec<RenderedInst>,
}

impl Word {
    pub fn new(label: usize, region: Region, kind: WordKind, templates: Vec<String>) -> Self {
        Word {
            label,
            region,
            kind,
            templates,
            xreg_slots: Vec::new(),
            freg_slots: Vec::new(),
            imm_slots: Vec::new(),
            sym_slots: Vec::new(),
            resolved: false,
            rendered: Vec::new(),
        }
    }

    /// A single-`nop` Word, used by the minimizer as the neutral filler.
    pub fn nop(label: usize, region: Region) -> Self {
        let mut word = Word::new(label, region, WordKind::Plain, vec!["nop".to_string()]);
        word.rendered = vec![RenderedInst::plain("nop")];
        word.resolved = true;
        word
    }

    /// Rebuild a resolved Word directly from rendered lines, as when
    /// reading a saved input back from disk.
    pub fn from_rendered(label: usize, region: Region, lines: Vec<RenderedInst>) -> Self {
        let kind = if lines.iter().any(|l| matches!(l.symbol(), Some(SymbolRef::Forward { .. }))) {
            WordKind::Jump
        } else {
            WordKind::Plain
        };
        let templates = lines.iter().map(|l| l.text(region)).collect();
        let mut word = Word::new(label, region, kind, templates);
        word.rendered = lines;
        word.resolved = true;
        word
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn is_nop(&self) -> bool {
        self.rendered.len() == 1 && self.rendered[0].before == "nop" && self.rendered[0].symbol.is_none()
    }

    /// Number of rendered instruction lines. Zero until resolved.
    pub fn len_insts(&self) -> usize {
        self.rendered.len()
    }

    pub fn rendered(&self) -> &[RenderedInst] {
        &self.rendered
    }

    /// Final assembly lines of a resolved Word.
    pub fn inst_lines(&self) -> Vec<String> {
        debug_assert!(self.resolved, "Word {} rendered before resolution", self.label);
        self.rendered.iter().map(|l| l.text(self.region)).collect()
    }

    /// Bind every operand slot and freeze the instruction text.
    ///
    /// Slot names are substituted longest-first so `imm6` can never eat
    /// the tail of `uimm6`. A template may carry at most one symbol slot.
    pub fn populate(&mut self, bindings: &HashMap<String, OperandValue>) -> Result<(), String> {
        if self.resolved {
            return Ok(());
        }

        let mut slot_names: Vec<&String> = self
            .xreg_slots
            .iter()
            .chain(self.freg_slots.iter())
            .chain(self.imm_slots.iter().map(|(name, _)| name))
            .chain(self.sym_slots.iter())
            .collect();
        slot_names.sort_by_key(|name| std::cmp::Reverse(name.len()));

        for name in &slot_names {
            if !bindings.contains_key(name.as_str()) {
                return Err(format!("slot {} of word {} is unbound", name, self.label));
            }
        }

        let mut rendered = Vec::with_capacity(self.templates.len());
        for template in &self.templates {
            let mut text = template.clone();
            for name in &slot_names {
                if let Some(OperandValue::Text(value)) = bindings.get(name.as_str()) {
                    text = text.replace(name.as_str(), value);
                }
            }

            let mut symbol = None;
            let mut tail = String::new();
            for name in &slot_names {
                if let Some(OperandValue::Symbol(sym)) = bindings.get(name.as_str()) {
                    if let Some(at) = text.find(name.as_str()) {
                        if symbol.is_some() {
                            return Err(format!(
                                "word {} template carries two symbol slots",
                                self.label
                            ));
                        }
                        tail = text[at + name.len()..].to_string();
                        text.truncate(at);
                        symbol = Some(*sym);
                    }
                }
            }

            rendered.push(match symbol {
                Some(sym) => RenderedInst::with_symbol(text, sym, tail),
                None => RenderedInst::plain(text),
            });
        }

        self.rendered = rendered;
        self.resolved = true;
        Ok(())
    }

    /// Renumber this Word in place. Returns the `(old, new)` pair for the
    /// caller's label map when the Word is already rendered.
    pub fn reset_label(&mut self, new_label: usize) -> Option<(usize, usize)> {
        let old = self.label;
        self.label = new_label;
        if self.resolved {
            Some((old, new_label))
        } else {
            None
        }
    }

    /// Rewrite forward references after a renumbering pass. A reference
    /// whose target survived is remapped through `label_map`; one whose
    /// target was dropped is re-randomized to any valid forward label
    /// `<= max_label`.
    pub fn repair_refs(
        &mut self,
        label_map: &HashMap<usize, usize>,
        max_label: usize,
        rng: &mut StdRng,
    ) {
        if !self.resolved {
            return;
        }
        let label = self.label;
        for line in &mut self.rendered {
            if let Some(SymbolRef::Forward { label: old }) = line.symbol() {
                let new = match label_map.get(&old) {
                    Some(&mapped) if mapped > label => mapped,
                    _ => rng.random_range(label + 1..=max_label),
                };
                line.set_symbol(SymbolRef::Forward { label: new });
            }
        }
    }

    /// All forward targets referenced from this Word's rendered lines.
    pub fn forward_targets(&self) -> Vec<usize> {
        self.rendered
            .iter()
            .filter_map(|line| match line.symbol() {
                Some(SymbolRef::Forward { label }) => Some(label),
                _ => None,
            })
            .collect()
    }
}

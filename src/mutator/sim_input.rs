//! A complete fuzz test case and its on-disk `.si` format.
//!
//! ## File Format
//!
//! ```text
//! p-m
//!
//! _p0:    csrrwi x11, sstatus, 14
//! _l0:    la x5, d_2_7
//!         lw x7, 4(x5)                              0000
//! _l1:    jal x1, _l2                               0100
//! _s0:    fence
//! data:
//! 00000000deadbeef
//! ...
//! ```
//!
//! Each instruction line is 50 columns: an 8-column label field, then the
//! instruction text. Main-region lines carry a 4-bit binary interrupt
//! mask in columns 50..54. The format round-trips exactly: parsing a
//! saved file reproduces the same instruction stream, masks and data.

use crate::word::{Region, RenderedInst, SymbolRef, Word};
use std::fs;
use std::path::Path;

/// Test templates the preprocessor can render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateId {
    /// Physical memory, machine mode.
    PM,
    /// Physical memory, supervisor mode.
    PS,
    /// Physical memory, user mode.
    PU,
    /// Virtual memory, user mode.
    VU,
}

pub const TEMPLATE_COUNT: usize = 4;

impl TemplateId {
    pub fn name(self) -> &'static str {
        match self {
            TemplateId::PM => "p-m",
            TemplateId::PS => "p-s",
            TemplateId::PU => "p-u",
            TemplateId::VU => "v-u",
        }
    }

    pub fn from_name(name: &str) -> Option<TemplateId> {
        match name {
            "p-m" => Some(TemplateId::PM),
            "p-s" => Some(TemplateId::PS),
            "p-u" => Some(TemplateId::PU),
            "v-u" => Some(TemplateId::VU),
            _ => None,
        }
    }

    pub fn from_index(index: usize) -> TemplateId {
        match index % TEMPLATE_COUNT {
            0 => TemplateId::PM,
            1 => TemplateId::PS,
            2 => TemplateId::PU,
            _ => TemplateId::VU,
        }
    }

    /// RTL simulation budget. Virtual-memory tests walk page tables and
    /// need far more cycles.
    pub fn max_cycles(self) -> u64 {
        match self {
            TemplateId::VU => 200_000,
            _ => 6_000,
        }
    }
}

/// A complete fuzz test case: three word regions, the per-instruction
/// interrupt mask of the main region, and a reference into the random
/// data pool.
#[derive(Debug, Clone)]
pub struct SimInput {
    pub prefix: Vec<Word>,
    pub main: Vec<Word>,
    pub suffix: Vec<Word>,
    /// One 4-bit entry per rendered main-region instruction line.
    pub interrupts: Vec<u8>,
    pub data_seed: usize,
    pub template: TemplateId,
}

/// A SimInput read back from disk, before its data has been re-homed in
/// a mutator's pool.
#[derive(Debug)]
pub struct ParsedInput {
    pub prefix: Vec<Word>,
    pub main: Vec<Word>,
    pub suffix: Vec<Word>,
    pub interrupts: Vec<u8>,
    pub template: TemplateId,
    pub data: Vec<u64>,
}

fn format_line(label_field: &str, text: &str) -> String {
    format!("{:<8}{:<42}", label_field, text)
}

impl SimInput {
    pub fn new(
        prefix: Vec<Word>,
        main: Vec<Word>,
        suffix: Vec<Word>,
        interrupts: Vec<u8>,
        data_seed: usize,
        template: TemplateId,
    ) -> Self {
        SimInput {
            prefix,
            main,
            suffix,
            interrupts,
            data_seed,
            template,
        }
    }

    pub fn region(&self, region: Region) -> &[Word] {
        match region {
            Region::Prefix => &self.prefix,
            Region::Main => &self.main,
            Region::Suffix => &self.suffix,
        }
    }

    pub fn region_mut(&mut self, region: Region) -> &mut Vec<Word> {
        match region {
            Region::Prefix => &mut self.prefix,
            Region::Main => &mut self.main,
            Region::Suffix => &mut self.suffix,
        }
    }

    /// Total rendered instruction lines in the main region; the
    /// interrupt mask must have exactly this many entries.
    pub fn main_inst_count(&self) -> usize {
        self.main.iter().map(Word::len_insts).sum()
    }

    /// Labeled instruction lines of one region, without the terminator.
    pub fn word_lines(&self, region: Region) -> Vec<String> {
        let mut lines = Vec::new();
        for word in self.region(region) {
            let mut first = true;
            for text in word.inst_lines() {
                let label_field = if first {
                    format!("{}{}:", region.label_tag(), word.label)
                } else {
                    String::new()
                };
                lines.push(format_line(&label_field, &text));
                first = false;
            }
        }
        lines
    }

    /// Region lines plus the terminator label every forward reference may
    /// legally target.
    pub fn region_lines(&self, region: Region) -> Vec<String> {
        let mut lines = self.word_lines(region);
        lines.push(format!(
            "{}{}:",
            region.label_tag(),
            self.region(region).len()
        ));
        lines
    }

    /// Serialize to the `.si` format, appending the backing random data.
    pub fn render(&self, data: &[u64]) -> Result<String, String> {
        let mut out = String::new();
        out.push_str(self.template.name());
        out.push_str("\n\n");

        for line in self.word_lines(Region::Prefix) {
            out.push_str(&line);
            out.push('\n');
        }
        let main_lines = self.word_lines(Region::Main);
        if main_lines.len() != self.interrupts.len() {
            return Err(format!(
                "interrupt mask length {} does not cover {} main instructions",
                self.interrupts.len(),
                main_lines.len()
            ));
        }
        for (line, mask) in main_lines.iter().zip(self.interrupts.iter()) {
            out.push_str(&format!("{}{:04b}\n", line, mask));
        }
        for line in self.word_lines(Region::Suffix) {
            out.push_str(&line);
            out.push('\n');
        }

        if !data.is_empty() {
            out.push_str("data:\n");
            for word in data {
                out.push_str(&format!("{:016x}\n", word));
            }
        }
        Ok(out)
    }

    pub fn save(&self, path: &Path, data: &[u64]) -> Result<(), String> {
        let out = self.render(data)?;
        fs::write(path, out).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
    }

    pub fn load(path: &Path) -> Result<ParsedInput, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    /// Parse the `.si` format back into words, masks and data.
    pub fn parse(content: &str) -> Result<ParsedInput, String> {
        let mut lines = content.lines();
        let template_name = lines.next().ok_or("empty input file")?.trim();
        let template = TemplateId::from_name(template_name)
            .ok_or_else(|| format!("unknown template '{}'", template_name))?;

        let mut prefix: Vec<(usize, Vec<RenderedInst>)> = Vec::new();
        let mut main: Vec<(usize, Vec<RenderedInst>)> = Vec::new();
        let mut suffix: Vec<(usize, Vec<RenderedInst>)> = Vec::new();
        let mut interrupts = Vec::new();
        let mut data = Vec::new();

        let mut current: Option<Region> = None;
        let mut in_data = false;

        for (line_num, raw) in lines.enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            if in_data {
                let word = u64::from_str_radix(raw.trim(), 16)
                    .map_err(|_| format!("Line {}: invalid data word", line_num + 2))?;
                data.push(word);
                continue;
            }
            if raw.starts_with("data:") {
                in_data = true;
                continue;
            }

            let label_field: String = raw.chars().take(8).collect();
            let text_end = raw.len().min(50);
            let text = raw[8.min(raw.len())..text_end].trim().to_string();

            let region = if let Some(label) = parse_label_field(label_field.trim()) {
                let (region, number) = label;
                let words = match region {
                    Region::Prefix => &mut prefix,
                    Region::Main => &mut main,
                    Region::Suffix => &mut suffix,
                };
                words.push((number, Vec::new()));
                current = Some(region);
                region
            } else {
                current.ok_or_else(|| format!("Line {}: instruction before any label", line_num + 2))?
            };

            let inst = parse_rendered_line(&text, region);
            match region {
                Region::Prefix => prefix.last_mut().unwrap().1.push(inst),
                Region::Main => main.last_mut().unwrap().1.push(inst),
                Region::Suffix => suffix.last_mut().unwrap().1.push(inst),
            }

            if region == Region::Main {
                let mask_text = raw.get(50..54).ok_or_else(|| {
                    format!("Line {}: main instruction lacks interrupt mask", line_num + 2)
                })?;
                let mask = u8::from_str_radix(mask_text, 2)
                    .map_err(|_| format!("Line {}: invalid interrupt mask", line_num + 2))?;
                interrupts.push(mask);
            }
        }

        let build = |tuples: Vec<(usize, Vec<RenderedInst>)>, region: Region| -> Vec<Word> {
            tuples
                .into_iter()
                .map(|(label, insts)| Word::from_rendered(label, region, insts))
                .collect()
        };

        Ok(ParsedInput {
            prefix: build(prefix, Region::Prefix),
            main: build(main, Region::Main),
            suffix: build(suffix, Region::Suffix),
            interrupts,
            template,
            data,
        })
    }
}

/// `_l12:` → `(Main, 12)`; anything else is a continuation line.
fn parse_label_field(field: &str) -> Option<(Region, usize)> {
    let label = field.strip_suffix(':')?;
    for region in Region::all() {
        if let Some(digits) = label.strip_prefix(region.label_tag()) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return Some((region, digits.parse().ok()?));
            }
        }
    }
    None
}

/// Re-extract the structured forward reference, if any, from a rendered
/// instruction. Operands are tokenized, never substring-matched, so a
/// label number that happens to appear inside another token can not
/// misfire.
fn parse_rendered_line(text: &str, region: Region) -> RenderedInst {
    let tag = region.label_tag();
    for (offset, token) in operand_tokens(text) {
        if let Some(digits) = token.strip_prefix(tag) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(label) = digits.parse() {
                    return RenderedInst::with_symbol(
                        &text[..offset],
                        SymbolRef::Forward { label },
                        &text[offset + token.len()..],
                    );
                }
            }
        }
    }
    RenderedInst::plain(text)
}

fn operand_tokens(text: &str) -> Vec<(usize, &str)> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        let boundary = c == ' ' || c == ',' || c == '(' || c == ')';
        match (boundary, start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                tokens.push((s, &text[s..i]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push((s, &text[s..]));
    }
    tokens
}

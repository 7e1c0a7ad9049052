//! Differential signature checker.
//!
//! Both backends dump architectural state as a flat file of 128-bit
//! lines (two little-endian 64-bit words per line). The checker derives
//! every field's offset from the linked binary's symbol table and
//! requires exact equality of all 32 integer registers, all 32 float
//! registers, the fixed CSR set and each random-data section.

use crate::backend::SymbolTable;
use crate::isa::{Privilege, CSR_NAMES, NUM_DATA_SECTIONS};
use std::path::{Path, PathBuf};

pub struct SigChecker {
    isa_sig: PathBuf,
    rtl_sig: PathBuf,
}

struct SigLayout {
    xreg_idx: Vec<usize>,
    freg_idx: Vec<usize>,
    csr_idx: Vec<(&'static str, usize)>,
    /// (start address, end address) per random-data section.
    data_ranges: Vec<(u64, u64)>,
    /// First line of the data dump, right after the register signature.
    data_line_start: usize,
}

struct SigValues {
    xregs: Vec<u64>,
    fregs: Vec<u64>,
    csrs: Vec<u64>,
    data: Vec<Vec<u64>>,
}

fn symbol(symbols: &SymbolTable, name: &str) -> Result<u64, String> {
    symbols
        .get(name)
        .copied()
        .ok_or_else(|| format!("symbol {} missing from test binary", name))
}

impl SigChecker {
    pub fn new(isa_sig: PathBuf, rtl_sig: PathBuf) -> Self {
        SigChecker { isa_sig, rtl_sig }
    }

    fn layout(symbols: &SymbolTable) -> Result<SigLayout, String> {
        let begin = symbol(symbols, "begin_signature")?;
        let end = symbol(symbols, "end_signature")?;

        let mut xreg_idx = Vec::with_capacity(32);
        for i in 0..32 {
            let addr = symbol(symbols, &format!("reg_x{}_output", i))?;
            xreg_idx.push(((addr - begin) / 8) as usize);
        }
        let mut freg_idx = Vec::with_capacity(32);
        for i in 0..32 {
            let addr = symbol(symbols, &format!("reg_f{}_output", i))?;
            freg_idx.push(((addr - begin) / 8) as usize);
        }
        let mut csr_idx = Vec::with_capacity(CSR_NAMES.len());
        for name in CSR_NAMES {
            let addr = symbol(symbols, &format!("{}_output", name))?;
            csr_idx.push((name, ((addr - begin) / 8) as usize));
        }

        let mut data_ranges = Vec::with_capacity(NUM_DATA_SECTIONS);
        for i in 0..NUM_DATA_SECTIONS {
            let start = symbol(symbols, &format!("_random_data{}", i))?;
            let stop = symbol(symbols, &format!("_end_data{}", i))?;
            data_ranges.push((start, stop));
        }

        Ok(SigLayout {
            xreg_idx,
            freg_idx,
            csr_idx,
            data_ranges,
            data_line_start: ((end - begin) / 16) as usize,
        })
    }

    fn read_sig(path: &Path, layout: &SigLayout) -> Result<SigValues, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read signature {}: {}", path.display(), e))?;
        let lines: Vec<&str> = content.lines().collect();

        let value_at = |idx: usize| -> Result<u64, String> {
            let line = lines
                .get(idx / 2)
                .ok_or_else(|| format!("signature {} truncated at word {}", path.display(), idx))?;
            let range = if idx % 2 == 0 { 16..32 } else { 0..16 };
            let field = line
                .get(range)
                .ok_or_else(|| format!("signature {} has a short line", path.display()))?;
            u64::from_str_radix(field, 16)
                .map_err(|_| format!("signature {} has a non-hex field", path.display()))
        };

        let xregs = layout.xreg_idx.iter().map(|&i| value_at(i)).collect::<Result<_, _>>()?;
        let fregs = layout.freg_idx.iter().map(|&i| value_at(i)).collect::<Result<_, _>>()?;
        let csrs = layout
            .csr_idx
            .iter()
            .map(|&(_, i)| value_at(i))
            .collect::<Result<_, _>>()?;

        let mut data = Vec::with_capacity(layout.data_ranges.len());
        let mut line_idx = layout.data_line_start;
        for &(start, stop) in &layout.data_ranges {
            let section_lines = ((stop - start) / 16) as usize;
            let mut section = Vec::with_capacity(section_lines * 2);
            for j in 0..section_lines {
                let line = lines.get(line_idx + j).ok_or_else(|| {
                    format!("signature {} truncated in data dump", path.display())
                })?;
                let low = line
                    .get(16..32)
                    .ok_or_else(|| format!("signature {} has a short data line", path.display()))?;
                let high = line
                    .get(0..16)
                    .ok_or_else(|| format!("signature {} has a short data line", path.display()))?;
                section.push(
                    u64::from_str_radix(low, 16)
                        .map_err(|_| format!("signature {} has a non-hex field", path.display()))?,
                );
                section.push(
                    u64::from_str_radix(high, 16)
                        .map_err(|_| format!("signature {} has a non-hex field", path.display()))?,
                );
            }
            line_idx += section_lines;
            data.push(section);
        }

        Ok(SigValues {
            xregs,
            fregs,
            csrs,
            data,
        })
    }

    /// Compare the two signature dumps field by field. `Ok(true)` means
    /// the backends agree on every field.
    pub fn check(&self, symbols: &SymbolTable) -> Result<bool, String> {
        let layout = Self::layout(symbols)?;
        let isa = Self::read_sig(&self.isa_sig, &layout)?;
        let rtl = Self::read_sig(&self.rtl_sig, &layout)?;

        let mut matched = true;
        for (i, (a, b)) in isa.xregs.iter().zip(&rtl.xregs).enumerate() {
            if a != b {
                matched = false;
                log::warn!("x{:02} mismatch: [ISA] {:016x} || [RTL] {:016x}", i, a, b);
            }
        }
        for (i, (a, b)) in isa.fregs.iter().zip(&rtl.fregs).enumerate() {
            if a != b {
                matched = false;
                log::warn!("f{:02} mismatch: [ISA] {:016x} || [RTL] {:016x}", i, a, b);
            }
        }
        for ((name, _), (a, b)) in layout.csr_idx.iter().zip(isa.csrs.iter().zip(&rtl.csrs)) {
            if a != b {
                matched = false;
                log::warn!("{} mismatch: [ISA] {:016x} || [RTL] {:016x}", name, a, b);
            }
        }
        for (section, (a, b)) in isa.data.iter().zip(&rtl.data).enumerate() {
            if a != b {
                matched = false;
                let (start, _) = layout.data_ranges[section];
                for (j, (x, y)) in a.iter().zip(b).enumerate() {
                    if x != y {
                        log::warn!(
                            "({:016x}) mismatch: [ISA] {:016x} || [RTL] {:016x}",
                            start + 8 * j as u64,
                            x,
                            y
                        );
                    }
                }
            }
        }
        Ok(matched)
    }

    /// Extract the asserted interrupt from the RTL dump: the privilege
    /// that took the trap and its exception return address. Supervisor
    /// and Machine are mutually exclusive; both set is a fatal invariant
    /// failure.
    pub fn check_interrupt(&self, symbols: &SymbolTable) -> Result<(Option<Privilege>, u64), String> {
        let layout = Self::layout(symbols)?;
        let rtl = Self::read_sig(&self.rtl_sig, &layout)?;

        let csr = |name: &str| -> Result<u64, String> {
            layout
                .csr_idx
                .iter()
                .position(|&(n, _)| n == name)
                .map(|pos| rtl.csrs[pos])
                .ok_or_else(|| format!("{} not in checked CSR set", name))
        };

        let scause = csr("scause")?;
        let sepc = csr("sepc")?;
        let mcause = csr("mcause")?;
        let mepc = csr("mepc")?;

        let s_intr = (scause >> 63) & 1 == 1;
        let m_intr = (mcause >> 63) & 1 == 1;
        if s_intr && m_intr {
            return Err("both supervisor and machine interrupts asserted".to_string());
        }

        let (privilege, epc) = if s_intr {
            (Some(Privilege::Supervisor), sepc)
        } else if m_intr {
            (Some(Privilege::Machine), mepc)
        } else {
            (None, 0)
        };
        if let Some(privilege) = privilege {
            log::info!("{} interrupt handled -- epc {:016x}", privilege, epc);
        }
        Ok((privilege, epc))
    }
}

use super::*;
use crate::mutator::Mutator;
use std::cell::RefCell;

struct MockToolchain {
    cc_exit: i32,
    flags_seen: RefCell<Vec<String>>,
    symbols: SymbolTable,
}

impl MockToolchain {
    fn new(cc_exit: i32) -> Self {
        let mut symbols = SymbolTable::new();
        symbols.insert("_fuzz_main".to_string(), 0x8000_0000);
        symbols.insert("begin_signature".to_string(), 0x8000_4000);
        MockToolchain {
            cc_exit,
            flags_seen: RefCell::new(Vec::new()),
            symbols,
        }
    }
}

impl Toolchain for MockToolchain {
    fn assemble_and_link(&self, _source: &Path, _elf: &Path, extra_flags: &[String]) -> io::Result<i32> {
        *self.flags_seen.borrow_mut() = extra_flags.to_vec();
        Ok(self.cc_exit)
    }

    fn elf_to_hex(&self, _elf: &Path, _hex: &Path) -> io::Result<i32> {
        Ok(0)
    }

    fn read_symbols(&self, _elf: &Path) -> io::Result<SymbolTable> {
        Ok(self.symbols.clone())
    }
}

fn setup(tag: &str, cc_exit: i32) -> Preprocessor<MockToolchain> {
    let dir = std::env::temp_dir().join(format!("harrow_pp_{}", tag));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("template")).unwrap();

    let mut template = String::from("#include \"fuzz_test.h\"\n_fuzz_prefix:\n_fuzz_main:\n_fuzz_suffix:\n");
    for section in 0..NUM_DATA_SECTIONS {
        template.push_str(&format!("_random_data{}:\n", section));
        template.push_str(&format!("_end_data{}:\n", section));
    }
    for name in ["p-m", "p-s", "p-u", "v-u"] {
        std::fs::write(dir.join("template").join(format!("rv64-{}.S", name)), &template).unwrap();
    }

    Preprocessor::new(MockToolchain::new(cc_exit), dir.join("template"), dir, 0)
}

fn test_input(seed: u64, assert_intr: bool) -> (SimInput, Vec<u64>) {
    let mut mutator = Mutator::new("RV64G", 10, 4, false, seed);
    mutator.num_prefix = 2;
    mutator.num_main = 5;
    mutator.num_suffix = 2;
    mutator.next(assert_intr).unwrap()
}

fn small_data() -> Vec<u64> {
    // Six sections of sixteen words keeps the rendered test readable.
    (0..(NUM_DATA_SECTIONS as u64 * 16)).map(|i| 0xaa00 + i).collect()
}

#[test]
fn process_renders_all_markers() {
    let preprocessor = setup("markers", 0);
    let (input, _) = test_input(3, false);
    let data = small_data();

    let prepared = preprocessor.process(&input, &data, false).unwrap().unwrap();
    assert_eq!(prepared.rtl.max_cycles, input.template.max_cycles());

    let assembly = std::fs::read_to_string(preprocessor.asm_path()).unwrap();
    // Every fuzz region lands behind its marker, terminator included.
    for word in &input.main {
        assert!(assembly.contains(&format!("_l{}:", word.label)));
    }
    assert!(assembly.contains(&format!("_l{}:", input.main.len())));
    assert!(assembly.contains(&format!("_p{}:", input.prefix.len())));
    assert!(assembly.contains(&format!("_s{}:", input.suffix.len())));
    // Data sections carry interior labels and the raw words.
    assert!(assembly.contains("d_0_0:"));
    assert!(assembly.contains(".dword 0x000000000000aa00, 0x000000000000aa01"));
    // The .si artifact is saved alongside.
    assert!(preprocessor.si_path().exists());
}

#[test]
fn data_section_labels_are_interior_only() {
    let preprocessor = setup("labels", 0);
    let (input, _) = test_input(4, false);
    let data = small_data();
    preprocessor.process(&input, &data, false).unwrap().unwrap();

    let assembly = std::fs::read_to_string(preprocessor.asm_path()).unwrap();
    // Sixteen words in two-word lines: positions 4..10 step 2 get labels.
    for entry in 0..4 {
        assert!(assembly.contains(&format!("d_2_{}:", entry)), "missing d_2_{}", entry);
    }
    assert!(!assembly.contains("d_2_4:"));
}

#[test]
fn compile_failure_yields_none() {
    let preprocessor = setup("ccfail", 1);
    let (input, _) = test_input(5, false);
    assert!(preprocessor.process(&input, &small_data(), false).unwrap().is_none());
}

#[test]
fn virtual_template_gets_entropy_flags() {
    let preprocessor = setup("ventropy", 0);
    let (mut input, _) = test_input(6, false);
    input.template = TemplateId::VU;
    let data = small_data();
    preprocessor.process(&input, &data, false).unwrap().unwrap();

    let flags = preprocessor.tool.flags_seen.borrow().clone();
    assert!(flags.iter().any(|f| f.starts_with("-DENTROPY=0x")));
    assert!(flags.contains(&"-O2".to_string()));
}

#[test]
fn physical_template_gets_p_include() {
    let preprocessor = setup("pinclude", 0);
    let (mut input, _) = test_input(6, false);
    input.template = TemplateId::PM;
    preprocessor.process(&input, &small_data(), true).unwrap().unwrap();

    let flags = preprocessor.tool.flags_seen.borrow().clone();
    assert!(flags.contains(&"-DINTERRUPT".to_string()));
    assert!(flags.iter().any(|f| f.ends_with("include/p")));
}

#[test]
fn interrupt_file_maps_the_asserted_instruction() {
    let preprocessor = setup("intr", 0);
    let (input, _) = test_input(8, true);
    let asserted: Vec<usize> = input
        .interrupts
        .iter()
        .enumerate()
        .filter(|(_, &mask)| mask != 0)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(asserted.len(), 1);

    preprocessor.process(&input, &small_data(), true).unwrap().unwrap();
    let content = std::fs::read_to_string(preprocessor.rtl_intr_path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);

    // Rebuild the address the expansion should produce: every `la` line
    // before the asserted slot widens the offset by one instruction.
    let mut machine_index = 0;
    let mut logical = 0;
    'outer: for word in &input.main {
        for text in word.inst_lines() {
            if logical == asserted[0] {
                break 'outer;
            }
            machine_index += 1;
            if text.starts_with("la ") {
                machine_index += 1;
            }
            logical += 1;
        }
    }
    let expected = format!("{:016x}", 0x8000_0000u64 + 4 * machine_index as u64);
    assert!(
        lines[0].starts_with(&expected),
        "expected address {} in line '{}'",
        expected,
        lines[0]
    );
}

#[test]
fn write_isa_intr_mirrors_the_rtl_assertion() {
    let preprocessor = setup("isaintr", 0);
    std::fs::write(preprocessor.rtl_intr_path(), "0000000080000010:0101\n").unwrap();

    let path = preprocessor.write_isa_intr(0x8000_2468).unwrap();
    let content = std::fs::read_to_string(path).unwrap();
    assert_eq!(content, "0000000080002468:0101\n");
}

#[test]
fn write_isa_intr_rejects_multiple_assertions() {
    let preprocessor = setup("isaintr2", 0);
    std::fs::write(
        preprocessor.rtl_intr_path(),
        "0000000080000010:0101\n0000000080000020:0011\n",
    )
    .unwrap();
    assert!(preprocessor.write_isa_intr(0x8000_2468).is_err());
}

#[test]
fn malformed_data_is_rejected() {
    let preprocessor = setup("baddata", 0);
    let (input, _) = test_input(9, false);
    assert!(preprocessor.process(&input, &[], false).is_err());
    // 6 sections of 3 words: not a power of two.
    let odd: Vec<u64> = (0..18).collect();
    assert!(preprocessor.process(&input, &odd, false).is_err());
}

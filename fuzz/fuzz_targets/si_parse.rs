#![no_main]

use harrow::SimInput;
use libfuzzer_sys::fuzz_target;

// The parser must reject or accept arbitrary bytes without panicking.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(parsed) = SimInput::parse(text) {
        // Whatever parsed must satisfy the mask invariant the mutator
        // relies on later, or have been rejected.
        let main_insts: usize = parsed.main.iter().map(|w| w.len_insts()).sum();
        assert_eq!(parsed.interrupts.len(), main_insts);
    }
});

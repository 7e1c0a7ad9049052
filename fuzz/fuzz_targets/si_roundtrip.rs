#![no_main]

use harrow::SimInput;
use libfuzzer_sys::fuzz_target;

// Parsing a rendered input and rendering it again must be a fixed point.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(parsed) = SimInput::parse(text) else {
        return;
    };

    let pool_data = parsed.data.clone();
    let input = SimInput::new(
        parsed.prefix,
        parsed.main,
        parsed.suffix,
        parsed.interrupts,
        0,
        parsed.template,
    );
    let Ok(rendered) = input.render(&pool_data) else {
        return;
    };

    let again = SimInput::parse(&rendered).expect("rendered input failed to parse");
    assert_eq!(again.template, input.template);
    assert_eq!(again.interrupts, input.interrupts);
    assert_eq!(again.data, pool_data);
    assert_eq!(again.main.len(), input.main.len());
    for (a, b) in again.main.iter().zip(&input.main) {
        assert_eq!(a.inst_lines(), b.inst_lines());
    }
});

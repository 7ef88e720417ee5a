//! Title length enforcement.

/// Ordered abbreviations applied to over-long titles. Order matters: the
/// longer GFCI phrase must go before its unparenthesized prefix.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("Ampere", "Amp"),
    ("Amperes", "Amp"),
    ("Amps", "Amp"),
    ("Voltage", "V"),
    ("Volt", "V"),
    ("Ground Fault Circuit Interrupter (GFCI)", "GFCI"),
    ("Ground Fault Circuit Interrupter", "GFCI"),
    ("Molded Case Circuit Breaker", "MCCB"),
    ("Circuit Breaker", "Breaker"),
    ("Solid-State Protection", "Solid-State"),
    ("Solid State Protection", "Solid-State"),
    ("Bolt-On Connections", "Bolt-On"),
    ("2-Pole", "2P"),
    ("3-Pole", "3P"),
    ("4-Pole", "4P"),
];

/// Shorten `title` to at most `max_len` characters.
///
/// Titles already within the limit are returned untouched. Otherwise the
/// abbreviation table is applied in passes until the title fits or stops
/// changing, and anything still too long is cut at `max_len` characters.
pub fn compact(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        return title.to_string();
    }

    let mut current = title.to_string();
    loop {
        let mut next = current.clone();
        for (long, short) in ABBREVIATIONS {
            if next.contains(long) {
                next = next.replace(long, short);
            }
        }
        let next = collapse_whitespace(&next);

        if next.chars().count() <= max_len {
            return next;
        }
        if next == current {
            break;
        }
        current = next;
    }

    current
        .chars()
        .take(max_len)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

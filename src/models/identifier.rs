//! Canonical model identifiers.
//!
//! Published variants sometimes carry a size alias (`openai_whisper-large-v3_turbo_954MB`)
//! that names the same model as the bare identifier. Everything keyed by model
//! (scan index, deletes, the active model) goes through [`normalize`] first.

const SIZE_UNITS: &[(&str, u64)] = &[("MB", 1_000_000), ("GB", 1_000_000_000)];

/// Map a raw identifier to its canonical form.
///
/// Trims whitespace and removes a trailing `_<digits><MB|GB>` alias (unit is
/// case-insensitive). A suffix that is not at the very end is left alone.
/// Stacked aliases are removed one after another, so `x_1GB_2MB` becomes
/// `x` rather than `x_1GB`. This keeps the result stable under repeated
/// application.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let mut current = raw.trim();
    while let Some((stem, _)) = split_size_suffix(current) {
        current = stem.trim();
    }
    current.to_string()
}

/// Decimal byte size encoded in a trailing size alias, if any
#[must_use]
pub fn size_hint_bytes(raw: &str) -> Option<u64> {
    split_size_suffix(raw.trim()).and_then(|(_, bytes)| bytes)
}

/// Split `stem_<digits><unit>` into the stem and the decoded size.
fn split_size_suffix(value: &str) -> Option<(&str, Option<u64>)> {
    let (stem, suffix) = value.rsplit_once('_')?;
    if stem.is_empty() {
        return None;
    }

    let digit_len = suffix.bytes().take_while(u8::is_ascii_digit).count();
    if digit_len == 0 {
        return None;
    }
    let (digits, unit) = suffix.split_at(digit_len);

    let multiplier = SIZE_UNITS
        .iter()
        .find(|(name, _)| unit.eq_ignore_ascii_case(name))
        .map(|(_, multiplier)| *multiplier)?;

    let bytes = digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier));
    Some((stem, bytes))
}

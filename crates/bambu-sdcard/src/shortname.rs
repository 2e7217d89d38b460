//! Legacy 8.3 short names and FAT timestamps for the host file listing.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{BridgeError, Result};

/// Punctuation allowed in a short name besides ASCII letters and digits.
const ALLOWED_PUNCTUATION: &str = "!#$%&'()-@^_`{}~";

/// Largest `~N` suffix tried before giving up.
const MAX_COUNTER: u32 = 99;

/// Derive a short name for `name` that is not in `used`.
///
/// Names whose stem fits in eight characters are kept as is (sanitized and
/// lower-cased). Everything else, and every name that is already taken,
/// becomes `prefix~N.ext` where the prefix shrinks as `N` gains digits.
pub fn dos_name(name: &str, used: &HashSet<String>) -> Result<String> {
    let (stem, extension) = split_extension(name);
    let stem = sanitize(stem);
    let mut extension = sanitize(extension);
    extension.truncate(3);

    let join = |stem: &str| {
        if extension.is_empty() {
            stem.to_string()
        } else {
            format!("{}.{}", stem, extension)
        }
    };

    let candidate = join(&stem);
    if stem.chars().count() <= 8 && !used.contains(&candidate) {
        return Ok(candidate);
    }

    let mut power = 1;
    for counter in 1..=MAX_COUNTER {
        if counter >= 10u32.pow(power) {
            power += 1;
        }
        let keep = 6 - power as usize + 1;
        let prefix: String = stem.chars().take(keep).collect();
        let candidate = join(&format!("{}~{}", prefix, counter));
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }

    Err(BridgeError::ShortNameExhausted(name.to_string()))
}

/// Pack a timestamp into the hex FAT date/time pair used by `M20 T`.
pub fn m20_timestamp(time: DateTime<Utc>) -> String {
    let year = (time.year() - 1980).clamp(0, 127) as u32;
    let date = (year << 9) | (time.month() << 5) | time.day();
    let clock = (time.hour() << 11) | (time.minute() << 5) | (time.second() / 2);
    format!("{:#x}", (date << 16) | clock)
}

/// Split at the last dot, ignoring leading dots.
fn split_extension(name: &str) -> (&str, &str) {
    let leading = name.len() - name.trim_start_matches('.').len();
    match name[leading..].rfind('.') {
        Some(index) => {
            let split = leading + index;
            (&name[..split], &name[split + 1..])
        }
        None => (name, ""),
    }
}

fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_ascii_alphanumeric() || ALLOWED_PUNCTUATION.contains(c) {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

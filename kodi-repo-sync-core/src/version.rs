//! Version ordering for release discovery.
//!
//! Kodi add-on versions are mostly dotted numbers with the odd suffix
//! (`1.2.0~beta1`, `2.0.0+matrix.1`). Versions are compared as a sequence of
//! runs: digit runs numerically, everything else case-insensitively. A digit
//! run sorts before a text run in the same position, so `1.10` > `1.9` and
//! `1.0` < `1.0.1`.

use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Run {
    // Declaration order is the ordering between kinds.
    Number(u128),
    Text(String),
}

fn runs(version: &str) -> Vec<Run> {
    let mut out = Vec::new();
    let mut chars = version.chars().peekable();
    while let Some(&first) = chars.peek() {
        let numeric = first.is_ascii_digit();
        let mut run = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() != numeric {
                break;
            }
            run.push(c);
            chars.next();
        }
        if numeric {
            let trimmed = run.trim_start_matches('0');
            // Runs too long for u128 fall back to comparing by length then text.
            match trimmed.parse::<u128>() {
                Ok(n) => out.push(Run::Number(n)),
                Err(_) if trimmed.is_empty() => out.push(Run::Number(0)),
                Err(_) => out.push(Run::Text(format!("{:0>64}", trimmed))),
            }
        } else {
            out.push(Run::Text(run.to_lowercase()));
        }
    }
    out
}

/// Compares two version strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    runs(a).cmp(&runs(b))
}

/// Returns the item with the highest version, the first one on ties.
pub fn latest<T, I, F>(items: I, version_of: F) -> Option<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> &str,
{
    let mut best: Option<T> = None;
    for item in items {
        let replace = match &best {
            Some(current) => compare(version_of(&item), version_of(current)) == Ordering::Greater,
            None => true,
        };
        if replace {
            best = Some(item);
        }
    }
    best
}

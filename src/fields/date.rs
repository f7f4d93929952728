//! Issue date canonicalization

use regex::Regex;
use std::sync::LazyLock;

use crate::config::FieldPolicy;

static SEPARATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]{4})-([0-9]{1,2})-([0-9]{1,2})").expect("static regex"));
static COMPACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]{4})([0-9]{2})([0-9]{2})").expect("static regex"));

/// Fold every accepted separator to `-` and drop whitespace and `日`
fn clean(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != '日')
        .map(|c| match c {
            '年' | '月' | '.' | '/' => '-',
            other => other,
        })
        .collect()
}

/// Canonical date: `YYYY-MM-DD` under [`FieldPolicy::Loose`], `YYYYMMDD`
/// under [`FieldPolicy::Strict`]. `None` when no date shape is found.
pub fn normalize(text: &str, policy: FieldPolicy) -> Option<String> {
    let cleaned = clean(text);

    let caps = SEPARATED
        .captures(&cleaned)
        .or_else(|| COMPACT.captures(&cleaned))?;

    let year = &caps[1];
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;

    Some(match policy {
        FieldPolicy::Loose => format!("{year}-{month:02}-{day:02}"),
        FieldPolicy::Strict => format!("{year}{month:02}{day:02}"),
    })
}

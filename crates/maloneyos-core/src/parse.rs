//! Helpers for turning `lsblk`, `zpool` and `efibootmgr` output into data the
//! phases can reason about.

use regex::Regex;
use std::sync::OnceLock;

/// Pool names from `zpool list -H -o name`.
pub(crate) fn pool_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// `(device, mountpoint)` rows from `lsblk -nrpo NAME,MOUNTPOINT` that carry
/// a mount point.
pub(crate) fn mounted_devices(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let name = columns.next()?;
            let mountpoint = columns.next()?;
            Some((unescape(name), unescape(mountpoint)))
        })
        .collect()
}

/// First `iso9660` device from `lsblk -rno PATH,FSTYPE,LABEL` whose label
/// starts with `label_prefix`.
pub(crate) fn iso_device(output: &str, label_prefix: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut columns = line.split_whitespace();
        let path = columns.next()?;
        let fstype = columns.next()?;
        let label = unescape(columns.next().unwrap_or(""));
        (fstype == "iso9660" && label.starts_with(label_prefix)).then(|| unescape(path))
    })
}

fn boot_entry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^Boot([0-9A-Fa-f]{4})\*?\s+(.*)$").expect("static boot entry pattern")
    })
}

/// Boot numbers of firmware entries labelled exactly `label`.
pub(crate) fn boot_entries_with_label(output: &str, label: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let caps = boot_entry_pattern().captures(line.trim_end())?;
            let rest = caps.get(2)?.as_str();
            let tail = rest.strip_prefix(label)?;
            let exact = tail.is_empty() || tail.starts_with(char::is_whitespace);
            exact.then(|| caps[1].to_string())
        })
        .collect()
}

/// `lsblk -r` escapes whitespace and other unsafe bytes as `\xNN`.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find("\\x") {
        out.push_str(&rest[..idx]);
        let hex = rest.get(idx + 2..idx + 4);
        match hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &rest[idx + 4..];
            }
            None => {
                out.push_str("\\x");
                rest = &rest[idx + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

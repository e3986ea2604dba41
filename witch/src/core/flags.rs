//! rclone flag handling shared by config validation and command building.

/// Flags that conflict with the dated version-folder scheme.
///
/// Age filters hide files from the sync, so deletions on the source would be
/// mirrored without their previous version being archived.
pub const PROHIBITED_FLAGS: [&str; 3] = ["--max-age", "--min-age", "--backup-dir"];

/// Split a configured flag entry into argv tokens.
///
/// An entry is a flag optionally followed by whitespace and a single value
/// (`"--include *.txt"`). The value keeps any inner whitespace so paths with
/// spaces survive.
pub fn split_flag(entry: &str) -> Vec<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Vec::new();
    }
    match entry.split_once(char::is_whitespace) {
        Some((flag, value)) => vec![flag.to_string(), value.trim().to_string()],
        None => vec![entry.to_string()],
    }
}

/// Return the configured entries that use a prohibited flag.
pub fn prohibited_flags<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| {
            let tokens = split_flag(entry.as_ref());
            let flag = tokens.first()?;
            let name = flag.split('=').next().unwrap_or(flag);
            PROHIBITED_FLAGS
                .contains(&name)
                .then(|| entry.as_ref().trim().to_string())
        })
        .collect()
}

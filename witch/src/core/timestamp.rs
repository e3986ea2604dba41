//! Version-folder timestamp tokens.

use std::fmt::Display;

use chrono::{DateTime, TimeZone};

/// Format of the per-tick version folder name under the version-archive root.
pub const VERSION_TOKEN_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Render the version token for a tick that started at `at`.
pub fn version_token<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format(VERSION_TOKEN_FORMAT).to_string()
}

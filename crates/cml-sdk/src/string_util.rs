use std::time::Duration;

/// String parsing helpers shared by the CLI and the drivers.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        }
    }

    /// Parse a human duration such as `"5 minutes"`, `"1h30m"`, `"300"` or `"never"`.
    ///
    /// Bare numbers are seconds. `"never"`, `"0"` and negative values yield
    /// `Ok(None)`, meaning "no timeout".
    pub fn parse_timeout(value: &str) -> anyhow::Result<Option<Duration>> {
        let value = value.trim().to_lowercase();
        if value.is_empty() {
            anyhow::bail!("duration must not be empty");
        }
        if value == "never" || value.starts_with('-') {
            return Ok(None);
        }

        if let Ok(secs) = value.parse::<u64>() {
            return Ok((secs > 0).then(|| Duration::from_secs(secs)));
        }

        let mut total: u64 = 0;
        let mut rest = value.as_str();
        while !rest.is_empty() {
            rest = rest.trim_start();
            let digits = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if digits == 0 {
                anyhow::bail!("invalid duration '{value}': expected a number before '{rest}'");
            }
            let amount: u64 = rest[..digits].parse()?;
            rest = rest[digits..].trim_start();

            let unit_len = rest
                .find(|c: char| !c.is_ascii_alphabetic())
                .unwrap_or(rest.len());
            let unit = &rest[..unit_len];
            rest = rest[unit_len..].trim_start_matches([' ', ',']);

            let multiplier = match unit {
                "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
                "m" | "min" | "mins" | "minute" | "minutes" => 60,
                "h" | "hr" | "hrs" | "hour" | "hours" => 60 * 60,
                "d" | "day" | "days" => 24 * 60 * 60,
                "w" | "week" | "weeks" => 7 * 24 * 60 * 60,
                other => anyhow::bail!("invalid duration '{value}': unknown unit '{other}'"),
            };
            total += amount * multiplier;
        }

        Ok((total > 0).then(|| Duration::from_secs(total)))
    }

    /// Split a comma separated list, trimming entries and dropping empties and duplicates.
    pub fn split_list(value: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if !out.iter().any(|existing| existing == item) {
                out.push(item.to_string());
            }
        }
        out
    }

    /// Return a prefix of at most `count` characters.
    pub fn substring_prefix(value: &str, count: usize) -> &str {
        match value.char_indices().nth(count) {
            Some((idx, _)) => &value[..idx],
            None => value,
        }
    }
}

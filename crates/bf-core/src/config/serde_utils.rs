//! Serde helpers for configuration values

/// `Duration` as whole seconds.
///
/// Written as an integer. Read from either an integer (`90`) or a string
/// with a unit suffix (`"90s"`, `"5m"`, `"1h"`), so timeouts in TOML can be
/// spelled the way operators think about them.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }

    /// Parse `<n>`, `<n>s`, `<n>m` or `<n>h`
    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let (digits, scale) = match text.char_indices().last() {
            Some((i, 's')) => (&text[..i], 1),
            Some((i, 'm')) => (&text[..i], 60),
            Some((i, 'h')) => (&text[..i], 3600),
            _ => (text, 1),
        };

        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration {:?}: expected e.g. 30, \"30s\", \"5m\"", text))?;
        value
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {:?} is too large", text))
    }
}

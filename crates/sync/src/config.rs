#![forbid(unsafe_code)]

pub const DEFAULT_QUEUE_NAME: &str = "indexing";
pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_TEMP_CONTAINER: &str = "temp";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub queue_name: String,
    /// Maximum ids per dispatched job.
    pub batch_size: usize,
    pub index_attachments: bool,
    pub temp_container: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            index_attachments: false,
            temp_container: DEFAULT_TEMP_CONTAINER.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive integer (got {value:?})")]
    InvalidNumber { name: &'static str, value: String },
    #[error("{name} must be a boolean (got {value:?})")]
    InvalidBool { name: &'static str, value: String },
}

impl SyncConfig {
    /// Reads `PL_QUEUE_NAME`, `PL_INDEX_BATCH_SIZE`, `PL_INDEX_ATTACHMENTS`
    /// and `PL_TEMP_CONTAINER`; unset or blank variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(value) = read("PL_QUEUE_NAME") {
            config.queue_name = value;
        }
        if let Some(value) = read("PL_INDEX_BATCH_SIZE") {
            config.batch_size = value
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidNumber {
                    name: "PL_INDEX_BATCH_SIZE",
                    value,
                })?;
        }
        if let Some(value) = read("PL_INDEX_ATTACHMENTS") {
            config.index_attachments = parse_bool(&value).ok_or(ConfigError::InvalidBool {
                name: "PL_INDEX_ATTACHMENTS",
                value,
            })?;
        }
        if let Some(value) = read("PL_TEMP_CONTAINER") {
            config.temp_container = value;
        }
        Ok(config)
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

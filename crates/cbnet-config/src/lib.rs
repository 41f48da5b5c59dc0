//! Configuration plumbing shared by cbnet crates.
//!
//! A configuration type implements [`Config`] and is served to readers
//! through a [`ConfigManager`], which validates every replacement and
//! re-reads its backing file on demand, applying only the fields the type
//! marks as hot-updatable.

pub mod manager;

pub use manager::ConfigManager;

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("field `{field}` expects {expected}")]
    TypeMismatch { field: String, expected: String },
    #[error("field `{field}` value {value} out of range [{}, {}]",
        .min.as_deref().unwrap_or("-inf"), .max.as_deref().unwrap_or("+inf"))]
    OutOfRange {
        field: String,
        value: String,
        min: Option<String>,
        max: Option<String>,
    },
    #[error("field `{field}` is invalid: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn out_of_range(
        field: &str,
        value: impl ToString,
        min: Option<impl ToString>,
        max: Option<impl ToString>,
    ) -> Self {
        ConfigError::OutOfRange {
            field: field.into(),
            value: value.to_string(),
            min: min.map(|v| v.to_string()),
            max: max.map(|v| v.to_string()),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A configuration section.
pub trait Config: Sized + Send + Sync + 'static {
    /// Build from a parsed TOML document; absent fields take defaults.
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError>;

    /// Copy the hot-updatable fields of `other` into `self`.
    fn hot_update(&mut self, other: &Self);

    /// Render back to TOML text.
    fn render(&self) -> String;

    fn validate(&self) -> Result<(), ConfigError>;
}

/// `Config::from_toml` for serde types with field defaults.
pub fn from_toml_serde<T: DeserializeOwned>(value: &toml::Value) -> Result<T, ConfigError> {
    Ok(value.clone().try_into()?)
}

/// `Config::render` for serde types. Falls back to an empty document if the
/// type cannot be expressed as TOML.
pub fn render_serde<T: Serialize>(value: &T) -> String {
    match toml::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "config render failed");
            String::new()
        }
    }
}

/// Parse TOML document text.
pub fn parse_document(text: &str) -> Result<toml::Value, ConfigError> {
    let table: toml::Table = toml::from_str(text)?;
    Ok(toml::Value::Table(table))
}

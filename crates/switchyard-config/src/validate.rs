//! Post-merge validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::{Config, LoggingSection, ShellSection, SystemSection};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];

/// Validate a merged configuration.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] naming the first bad field.
pub(crate) fn validate(config: &Config) -> ConfigResult<()> {
    validate_shell(&config.shell)?;
    validate_system(&config.system)?;
    validate_logging(&config.logging)?;
    Ok(())
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

fn validate_shell(shell: &ShellSection) -> ConfigResult<()> {
    if let Some(origin) = &shell.origin {
        url::Url::parse(origin)
            .map_err(|e| invalid("shell.origin", format!("not a URL: {e}")))?;
    }
    for (from, to) in &shell.url_mappings {
        let field = format!("shell.url_mappings.{from}");
        url::Url::parse(from).map_err(|e| invalid(&field, format!("source is not a URL: {e}")))?;
        url::Url::parse(to).map_err(|e| invalid(&field, format!("target is not a URL: {e}")))?;
    }
    for url in shell.args_for.keys() {
        url::Url::parse(url)
            .map_err(|e| invalid(format!("shell.args_for.{url}"), format!("not a URL: {e}")))?;
    }
    Ok(())
}

fn validate_system(system: &SystemSection) -> ConfigResult<()> {
    if system.max_handles == 0 {
        return Err(invalid("system.max_handles", "must be greater than 0"));
    }
    if system.max_message_bytes == 0 {
        return Err(invalid("system.max_message_bytes", "must be greater than 0"));
    }
    if system.max_message_handles == 0 {
        return Err(invalid("system.max_message_handles", "must be greater than 0"));
    }
    if system.max_shared_buffer_bytes == 0 {
        return Err(invalid("system.max_shared_buffer_bytes", "must be greater than 0"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingSection) -> ConfigResult<()> {
    if !LOG_LEVELS.contains(&logging.level.to_ascii_lowercase().as_str()) {
        return Err(invalid(
            "logging.level",
            format!("unknown level {:?}, expected one of {LOG_LEVELS:?}", logging.level),
        ));
    }
    if !LOG_FORMATS.contains(&logging.format.to_ascii_lowercase().as_str()) {
        return Err(invalid(
            "logging.format",
            format!("unknown format {:?}, expected one of {LOG_FORMATS:?}", logging.format),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config = Config::default();
        config.system.max_message_handles = 0;
        assert_eq!(field_of(validate(&config).unwrap_err()), "system.max_message_handles");
    }

    #[test]
    fn test_bad_origin_rejected() {
        let mut config = Config::default();
        config.shell.origin = Some("not a url".to_owned());
        assert_eq!(field_of(validate(&config).unwrap_err()), "shell.origin");
    }

    #[test]
    fn test_bad_mapping_rejected() {
        let mut config = Config::default();
        config
            .shell
            .url_mappings
            .insert("app:a".to_owned(), "::".to_owned());
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "shell.url_mappings.app:a"
        );
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.format");
    }

    #[test]
    fn test_level_is_case_insensitive() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_owned();
        validate(&config).unwrap();
    }
}

//! Environment variable fallbacks.
//!
//! Env vars only fill fields that no config file set.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::FieldSources;

/// Overrides the home directory used to find `config.toml`.
pub const HOME_ENV_VAR: &str = "SWITCHYARD_HOME";

/// How a mapped value is typed in the TOML tree.
#[derive(Clone, Copy)]
enum Kind {
    Str,
    Bool,
    Int,
}

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: Kind,
}

const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "SWITCHYARD_ORIGIN",
        field_path: "shell.origin",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: "SWITCHYARD_ENABLE_MULTIPROCESS",
        field_path: "shell.enable_multiprocess",
        kind: Kind::Bool,
    },
    EnvMapping {
        var_name: "SWITCHYARD_CHILD_PATH",
        field_path: "shell.child_path",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: "SWITCHYARD_MAX_HANDLES",
        field_path: "system.max_handles",
        kind: Kind::Int,
    },
    EnvMapping {
        var_name: "SWITCHYARD_LOG_LEVEL",
        field_path: "logging.level",
        kind: Kind::Str,
    },
    EnvMapping {
        var_name: "SWITCHYARD_LOG_FORMAT",
        field_path: "logging.format",
        kind: Kind::Str,
    },
];

/// Apply env fallbacks to fields no config file set.
///
/// Returns the number of env vars applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] when a value cannot be coerced to the
/// field's type.
pub(crate) fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if sources.contains(mapping.field_path) {
            continue;
        }
        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };
        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );
        let value = coerce(mapping, raw)?;
        set_field(merged, mapping.field_path, value);
        sources.insert(mapping.field_path.to_owned());
        count = count.saturating_add(1);
    }

    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let trimmed = raw.trim();
    match mapping.kind {
        Kind::Str => Ok(toml::Value::String(trimmed.to_owned())),
        Kind::Bool => match trimmed.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            _ => Err(ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected a boolean, got {trimmed:?}"),
            }),
        },
        Kind::Int => trimmed
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected an integer: {e}"),
            }),
    }
}

fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_fallback_fills_unset_fields() {
        let mut merged: toml::Value = toml::from_str("[shell]\n").unwrap();
        let mut sources = FieldSources::new();
        let env = vars(&[
            ("SWITCHYARD_ENABLE_MULTIPROCESS", "yes"),
            ("SWITCHYARD_MAX_HANDLES", " 64 "),
            ("SWITCHYARD_LOG_LEVEL", "debug"),
        ]);

        let applied = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();
        assert_eq!(applied, 3);
        assert_eq!(
            merged["shell"]["enable_multiprocess"].as_bool(),
            Some(true)
        );
        assert_eq!(merged["system"]["max_handles"].as_integer(), Some(64));
        assert_eq!(merged["logging"]["level"].as_str(), Some("debug"));
        assert!(sources.contains("logging.level"));
    }

    #[test]
    fn test_file_values_win_over_env() {
        let mut merged: toml::Value = toml::from_str("[logging]\nlevel = \"warn\"").unwrap();
        let mut sources = FieldSources::new();
        sources.insert("logging.level".to_owned());
        let env = vars(&[("SWITCHYARD_LOG_LEVEL", "trace")]);

        let applied = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(merged["logging"]["level"].as_str(), Some("warn"));
    }

    #[test]
    fn test_bad_bool_is_env_error() {
        let mut merged: toml::Value = toml::from_str("").unwrap();
        let mut sources = FieldSources::new();
        let env = vars(&[("SWITCHYARD_ENABLE_MULTIPROCESS", "maybe")]);

        let err = apply_env_fallbacks(&mut merged, &mut sources, &env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::EnvError { ref var_name, .. }
                if var_name == "SWITCHYARD_ENABLE_MULTIPROCESS"
        ));
    }
}

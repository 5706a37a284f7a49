//! Layer merging.

use std::collections::BTreeSet;

/// Dotted paths of every leaf set by a config file.
pub type FieldSources = BTreeSet<String>;

/// Deep-merge `overlay` into `base`, recording each leaf the overlay sets.
///
/// Tables merge per key; scalars and arrays from the overlay replace the base.
pub(crate) fn deep_merge_tracking(
    base: &mut toml::Value,
    overlay: &toml::Value,
    prefix: &str,
    sources: &mut FieldSources,
) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let path = join(prefix, key);
                match base_table.get_mut(key) {
                    Some(base_val) if overlay_val.is_table() && base_val.is_table() => {
                        deep_merge_tracking(base_val, overlay_val, &path, sources);
                    },
                    Some(base_val) => {
                        *base_val = overlay_val.clone();
                        record_leaves(overlay_val, &path, sources);
                    },
                    None => {
                        base_table.insert(key.clone(), overlay_val.clone());
                        record_leaves(overlay_val, &path, sources);
                    },
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
            sources.insert(prefix.to_owned());
        },
    }
}

fn record_leaves(val: &toml::Value, prefix: &str, sources: &mut FieldSources) {
    match val {
        toml::Value::Table(table) if !table.is_empty() => {
            for (key, child) in table {
                record_leaves(child, &join(prefix, key), sources);
            }
        },
        _ => {
            sources.insert(prefix.to_owned());
        },
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn test_tables_merge_and_scalars_replace() {
        let mut base = parse(
            r#"
            [shell]
            enable_multiprocess = false
            [shell.url_mappings]
            "app:a" = "app:b"
            "#,
        );
        let overlay = parse(
            r#"
            [shell]
            enable_multiprocess = true
            [shell.url_mappings]
            "app:c" = "app:d"
            "#,
        );
        let mut sources = FieldSources::new();
        deep_merge_tracking(&mut base, &overlay, "", &mut sources);

        let shell = base.get("shell").unwrap();
        assert_eq!(shell.get("enable_multiprocess").unwrap().as_bool(), Some(true));
        let mappings = shell.get("url_mappings").unwrap().as_table().unwrap();
        assert_eq!(mappings.len(), 2);

        assert!(sources.contains("shell.enable_multiprocess"));
        assert!(sources.contains("shell.url_mappings.app:c"));
        assert!(!sources.contains("shell.url_mappings.app:a"));
    }

    #[test]
    fn test_new_section_records_leaves() {
        let mut base = parse("[logging]\nlevel = \"info\"");
        let overlay = parse("[system]\nmax_handles = 10");
        let mut sources = FieldSources::new();
        deep_merge_tracking(&mut base, &overlay, "", &mut sources);
        assert_eq!(
            base.get("system").unwrap().get("max_handles").unwrap().as_integer(),
            Some(10)
        );
        assert!(sources.contains("system.max_handles"));
    }
}

//! Command-line overrides applied on top of the loaded configuration.

use anyhow::{Result, bail};
use switchyard_config::Config;

use crate::Cli;

/// Apply every flag the user passed. Flags win over files and environment.
pub(crate) fn apply(config: &mut Config, cli: &Cli) -> Result<()> {
    let shell = &mut config.shell;
    if let Some(origin) = &cli.origin {
        shell.origin = Some(origin.clone());
    }
    if cli.enable_multiprocess {
        shell.enable_multiprocess = true;
    }
    if let Some(path) = &cli.child_path {
        shell.child_path = Some(path.clone());
    }
    if let Some(list) = &cli.url_mappings {
        for (from, to) in parse_mappings(list)? {
            shell.url_mappings.insert(from, to);
        }
    }
    for entry in &cli.args_for {
        let (url, args) = parse_args_for(entry)?;
        shell.args_for.entry(url).or_default().extend(args);
    }
    if let Some(format) = &cli.log_format {
        config.logging.format.clone_from(format);
    }
    Ok(())
}

/// `a=b,c=d` into pairs. Empty entries are skipped.
pub(crate) fn parse_mappings(list: &str) -> Result<Vec<(String, String)>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((from, to)) if !from.is_empty() && !to.is_empty() => {
                Ok((from.to_owned(), to.to_owned()))
            },
            _ => bail!("malformed URL mapping {entry:?} (expected FROM=TO)"),
        })
        .collect()
}

/// `"app:foo --a --b"` into the URL and its arguments.
pub(crate) fn parse_args_for(entry: &str) -> Result<(String, Vec<String>)> {
    let mut parts = entry.split_whitespace();
    let Some(url) = parts.next() else {
        bail!("--args-for needs a URL");
    };
    Ok((url.to_owned(), parts.map(str::to_owned).collect()))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_parse_mappings() {
        let pairs = parse_mappings("app:a=file:///a.app, app:b=app:c,").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("app:a".to_owned(), "file:///a.app".to_owned()),
                ("app:b".to_owned(), "app:c".to_owned()),
            ]
        );
        assert!(parse_mappings("app:a").is_err());
        assert!(parse_mappings("=app:a").is_err());
    }

    #[test]
    fn test_parse_args_for() {
        let (url, args) = parse_args_for("app:foo --x  y").unwrap();
        assert_eq!(url, "app:foo");
        assert_eq!(args, vec!["--x", "y"]);
        assert!(parse_args_for("   ").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "switchyard",
            "--origin",
            "file:///srv/apps/",
            "--enable-multiprocess",
            "--url-mappings",
            "app:a=app:b",
            "--args-for",
            "app:a one",
            "--args-for",
            "app:a two",
            "--log-format",
            "json",
            "app:a",
        ]);
        let mut config = Config::default();
        apply(&mut config, &cli).unwrap();

        assert_eq!(config.shell.origin.as_deref(), Some("file:///srv/apps/"));
        assert!(config.shell.enable_multiprocess);
        assert_eq!(config.shell.url_mappings["app:a"], "app:b");
        assert_eq!(config.shell.args_for["app:a"], vec!["one", "two"]);
        assert_eq!(config.logging.format, "json");
        config.validate().unwrap();
    }
}

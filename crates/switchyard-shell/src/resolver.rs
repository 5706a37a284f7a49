//! URL mapping and `app:` resolution.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::app_url::AppUrl;
use crate::error::{ShellError, ShellResult};

/// Scheme for applications served from the configured origin.
pub const APP_SCHEME: &str = "app";

/// File extension appended to `app:` names when resolved against the origin.
pub const APP_EXTENSION: &str = "app";

/// Applies custom URL mappings, then maps `app:<name>` onto the origin.
#[derive(Debug, Clone)]
pub struct UrlResolver {
    mappings: HashMap<String, String>,
    origin: AppUrl,
}

impl UrlResolver {
    /// A resolver serving `app:` URLs from `origin`.
    #[must_use]
    pub fn new(origin: AppUrl) -> Self {
        Self {
            mappings: HashMap::new(),
            origin: with_trailing_slash(origin),
        }
    }

    /// A resolver whose origin is the directory containing the running
    /// executable.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::Io`] if the executable path is unknown.
    pub fn for_current_exe() -> ShellResult<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe.parent().unwrap_or(&exe);
        let origin = url::Url::from_directory_path(dir)
            .map_err(|()| ShellError::NotAFile(dir.display().to_string()))?;
        Ok(Self::new(origin.into()))
    }

    /// The origin `app:` URLs resolve against. Always ends in `/`.
    #[must_use]
    pub fn origin(&self) -> &AppUrl {
        &self.origin
    }

    /// Replace the origin.
    pub fn set_origin(&mut self, origin: AppUrl) {
        self.origin = with_trailing_slash(origin);
    }

    /// Map `from` onto `to`. A later mapping for the same URL replaces the
    /// earlier one.
    pub fn add_mapping(&mut self, from: &AppUrl, to: &AppUrl) {
        debug!(from = %from, to = %to, "adding URL mapping");
        self.mappings.insert(from.to_string(), to.to_string());
    }

    /// Add mappings from a `from=to,from=to` list.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidUrl`] for a malformed pair or URL.
    pub fn add_mappings_from_list(&mut self, list: &str) -> ShellResult<()> {
        for pair in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (from, to) = pair.split_once('=').ok_or_else(|| ShellError::InvalidUrl {
                url: pair.to_owned(),
                source: url::ParseError::RelativeUrlWithoutBase,
            })?;
            self.add_mapping(&AppUrl::parse(from.trim())?, &AppUrl::parse(to.trim())?);
        }
        Ok(())
    }

    /// Apply custom mappings until none matches.
    ///
    /// A mapping cycle stops at the last URL before the first repeat.
    #[must_use]
    pub fn apply_mappings(&self, url: &AppUrl) -> AppUrl {
        let mut current = url.clone();
        let mut seen = HashSet::new();
        seen.insert(current.to_string());
        while let Some(next) = self.mappings.get(current.as_str()) {
            if !seen.insert(next.clone()) {
                warn!(url = %url, at = %current, "URL mapping cycle");
                break;
            }
            match AppUrl::parse(next) {
                Ok(next) => current = next,
                Err(e) => {
                    warn!(url = %current, error = %e, "ignoring malformed mapping target");
                    break;
                },
            }
        }
        current
    }

    /// Map an `app:` URL onto the origin; any other URL is returned
    /// unchanged. The query is kept.
    #[must_use]
    pub fn resolve_app_url(&self, url: &AppUrl) -> AppUrl {
        if url.scheme() != APP_SCHEME {
            return url.clone();
        }
        let name = url.as_url().path();
        let mut relative = format!("{name}.{APP_EXTENSION}");
        if let Some(query) = url.as_url().query() {
            relative.push('?');
            relative.push_str(query);
        }
        match self.origin.join(&relative) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(url = %url, error = %e, "cannot resolve against origin");
                url.clone()
            },
        }
    }

    /// Custom mappings first, then `app:` resolution.
    #[must_use]
    pub fn resolve(&self, url: &AppUrl) -> AppUrl {
        self.resolve_app_url(&self.apply_mappings(url))
    }
}

fn with_trailing_slash(origin: AppUrl) -> AppUrl {
    if origin.as_url().path().ends_with('/') {
        return origin;
    }
    let mut url = origin.as_url().clone();
    let path = format!("{}/", url.path());
    url.set_path(&path);
    url.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> AppUrl {
        AppUrl::parse(s).unwrap()
    }

    fn resolver() -> UrlResolver {
        UrlResolver::new(url("file:///opt/apps"))
    }

    #[test]
    fn test_origin_gets_trailing_slash() {
        assert_eq!(resolver().origin().as_str(), "file:///opt/apps/");
    }

    #[test]
    fn test_app_scheme_resolves_against_origin() {
        let r = resolver();
        assert_eq!(r.resolve(&url("app:echo")).as_str(), "file:///opt/apps/echo.app");
        assert_eq!(
            r.resolve(&url("app:echo?a&b")).as_str(),
            "file:///opt/apps/echo.app?a&b"
        );
    }

    #[test]
    fn test_other_schemes_unchanged() {
        let r = resolver();
        assert_eq!(r.resolve(&url("file:///tmp/x.app")).as_str(), "file:///tmp/x.app");
        assert_eq!(r.resolve(&url("custom:thing")).as_str(), "custom:thing");
    }

    #[test]
    fn test_mappings_apply_until_fixed_point() {
        let mut r = resolver();
        r.add_mapping(&url("app:a"), &url("app:b"));
        r.add_mapping(&url("app:b"), &url("app:c"));
        assert_eq!(r.apply_mappings(&url("app:a")).as_str(), "app:c");
        assert_eq!(r.resolve(&url("app:a")).as_str(), "file:///opt/apps/c.app");
    }

    #[test]
    fn test_mapping_cycle_terminates() {
        let mut r = resolver();
        r.add_mapping(&url("app:a"), &url("app:b"));
        r.add_mapping(&url("app:b"), &url("app:a"));
        assert_eq!(r.apply_mappings(&url("app:a")).as_str(), "app:b");
    }

    #[test]
    fn test_mappings_from_list() {
        let mut r = resolver();
        r.add_mappings_from_list("app:a=app:b, app:x=file:///y.app").unwrap();
        assert_eq!(r.apply_mappings(&url("app:x")).as_str(), "file:///y.app");
        assert!(r.add_mappings_from_list("app:a").is_err());
    }
}

//! Application URLs.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ShellError, ShellResult};

/// A parsed application URL such as `app:echo?verbose` or
/// `file:///opt/apps/echo.app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppUrl(url::Url);

impl AppUrl {
    /// Parse `text`.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidUrl`] if `text` is not an absolute URL.
    pub fn parse(text: &str) -> ShellResult<Self> {
        url::Url::parse(text)
            .map(Self)
            .map_err(|source| ShellError::InvalidUrl {
                url: text.to_owned(),
                source,
            })
    }

    /// The URL as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// The scheme, without the trailing colon.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// The underlying [`url::Url`].
    #[must_use]
    pub fn as_url(&self) -> &url::Url {
        &self.0
    }

    /// The same URL with its query (and fragment) removed. Running
    /// applications are identified by this form.
    #[must_use]
    pub fn without_query(&self) -> Self {
        let mut url = self.0.clone();
        url.set_query(None);
        url.set_fragment(None);
        Self(url)
    }

    /// Startup arguments carried in the query: `?a&b=c` yields `["a", "b=c"]`.
    #[must_use]
    pub fn query_args(&self) -> Vec<String> {
        self.0
            .query()
            .map(|q| {
                q.split('&')
                    .filter(|part| !part.is_empty())
                    .map(|part| {
                        url::form_urlencoded::parse(part.as_bytes())
                            .map(|(k, v)| {
                                if v.is_empty() && !part.contains('=') {
                                    k.into_owned()
                                } else {
                                    format!("{k}={v}")
                                }
                            })
                            .next()
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The local path of a `file:` URL.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::NotAFile`] for any other URL.
    pub fn to_file_path(&self) -> ShellResult<PathBuf> {
        if self.scheme() != "file" {
            return Err(ShellError::NotAFile(self.to_string()));
        }
        self.0
            .to_file_path()
            .map_err(|()| ShellError::NotAFile(self.to_string()))
    }

    /// Resolve `relative` against this URL.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidUrl`] if the result is not a valid URL.
    pub fn join(&self, relative: &str) -> ShellResult<Self> {
        self.0
            .join(relative)
            .map(Self)
            .map_err(|source| ShellError::InvalidUrl {
                url: relative.to_owned(),
                source,
            })
    }
}

impl fmt::Display for AppUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for AppUrl {
    type Err = ShellError;

    fn from_str(s: &str) -> ShellResult<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AppUrl {
    type Error = ShellError;

    fn try_from(s: String) -> ShellResult<Self> {
        Self::parse(&s)
    }
}

impl From<AppUrl> for String {
    fn from(url: AppUrl) -> Self {
        url.0.into()
    }
}

impl From<url::Url> for AppUrl {
    fn from(url: url::Url) -> Self {
        Self(url)
    }
}

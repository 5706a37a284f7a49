//! The loader seam between the [`ApplicationManager`] and whatever turns a
//! URL into a running application.
//!
//! [`ApplicationManager`]: crate::ApplicationManager

use switchyard_system::Handle;

use crate::app_url::AppUrl;

/// Turns a URL into a running application.
///
/// `load` must eventually either hand `application_request` to a running
/// application or close it. Called on the shell thread.
pub trait ApplicationLoader: Send + Sync {
    /// Start the application at `url`, bound to `application_request`.
    fn load(&self, url: &AppUrl, application_request: Handle);

    /// The application loaded from `url` has gone away.
    fn on_application_error(&self, _url: &AppUrl) {}
}

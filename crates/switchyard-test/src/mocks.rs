//! Mock loaders and code units.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use switchyard_shell::{
    AppUrl, ApplicationLoader, CodeUnit, CodeUnitLoader, ShellError, ShellResult,
};
use switchyard_system::{Core, Handle};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call to [`ApplicationLoader::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRecord {
    /// URL the loader was asked for.
    pub url: AppUrl,
    /// Application pipe handed to the loader.
    pub application_request: Handle,
}

/// Application loader that records every call.
///
/// By default the application request is kept open so the test can play
/// the application; [`RecordingLoader::closing`] closes it immediately.
#[derive(Debug)]
pub struct RecordingLoader {
    core: Arc<Core>,
    close_requests: bool,
    loads: Mutex<Vec<LoadRecord>>,
    errors: Mutex<Vec<AppUrl>>,
}

impl RecordingLoader {
    /// A loader that keeps application requests open.
    #[must_use]
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            close_requests: false,
            loads: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// A loader that closes every application request, like an application
    /// exiting straight away.
    #[must_use]
    pub fn closing(core: Arc<Core>) -> Self {
        Self {
            close_requests: true,
            ..Self::new(core)
        }
    }

    /// Number of `load` calls.
    #[must_use]
    pub fn load_count(&self) -> usize {
        lock(&self.loads).len()
    }

    /// Every `load` call so far.
    #[must_use]
    pub fn loads(&self) -> Vec<LoadRecord> {
        lock(&self.loads).clone()
    }

    /// The most recent `load` call.
    #[must_use]
    pub fn last_load(&self) -> Option<LoadRecord> {
        lock(&self.loads).last().cloned()
    }

    /// URLs reported through `on_application_error`.
    #[must_use]
    pub fn errors(&self) -> Vec<AppUrl> {
        lock(&self.errors).clone()
    }
}

impl ApplicationLoader for RecordingLoader {
    fn load(&self, url: &AppUrl, application_request: Handle) {
        lock(&self.loads).push(LoadRecord {
            url: url.clone(),
            application_request,
        });
        if self.close_requests {
            let _ = self.core.close(application_request);
        }
    }

    fn on_application_error(&self, url: &AppUrl) {
        lock(&self.errors).push(url.clone());
    }
}

type RunFn = dyn Fn(&Arc<Core>, Handle) -> i32 + Send + Sync;

/// Code unit whose entry point is a closure.
pub struct FnCodeUnit {
    run: Box<RunFn>,
}

impl FnCodeUnit {
    /// Wrap `run` as a code unit.
    pub fn new(run: impl Fn(&Arc<Core>, Handle) -> i32 + Send + Sync + 'static) -> Self {
        Self { run: Box::new(run) }
    }

    /// A code unit that returns `result` immediately.
    #[must_use]
    pub fn returning(result: i32) -> Self {
        Self::new(move |_, _| result)
    }
}

impl CodeUnit for FnCodeUnit {
    fn run(&self, core: &Arc<Core>, application_request: Handle) -> i32 {
        (self.run)(core, application_request)
    }
}

impl std::fmt::Debug for FnCodeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCodeUnit").finish_non_exhaustive()
    }
}

/// Code unit loader serving units registered per path.
#[derive(Default)]
pub struct StaticCodeUnitLoader {
    units: Mutex<HashMap<PathBuf, Arc<dyn CodeUnit>>>,
    loaded: Mutex<Vec<PathBuf>>,
}

impl StaticCodeUnitLoader {
    /// An empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `unit` for `path`.
    #[must_use]
    pub fn with_unit(self, path: impl Into<PathBuf>, unit: impl CodeUnit + 'static) -> Self {
        lock(&self.units).insert(path.into(), Arc::new(unit));
        self
    }

    /// Paths loaded so far.
    #[must_use]
    pub fn loaded(&self) -> Vec<PathBuf> {
        lock(&self.loaded).clone()
    }
}

impl CodeUnitLoader for StaticCodeUnitLoader {
    fn load(&self, path: &Path) -> ShellResult<Arc<dyn CodeUnit>> {
        let unit = lock(&self.units)
            .get(path)
            .cloned()
            .ok_or_else(|| ShellError::AppNotFound(path.to_path_buf()))?;
        lock(&self.loaded).push(path.to_path_buf());
        Ok(unit)
    }
}

impl std::fmt::Debug for StaticCodeUnitLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCodeUnitLoader")
            .field("units", &lock(&self.units).keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

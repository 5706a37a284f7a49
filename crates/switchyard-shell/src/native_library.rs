//! Code units backed by shared libraries.
//!
//! A library exports `SwitchyardMain(u64) -> i32`, which receives the raw
//! application request handle. It may also export
//! `SwitchyardSetSystemThunks(*const SystemThunks) -> usize`, which is called
//! first with a table of C entry points bound to the hosting [`Core`].

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use switchyard_system::{Core, Handle, ResultCode, Signals, SystemResult};
use tracing::{debug, error};

use crate::code_unit::{CodeUnit, CodeUnitLoader};
use crate::error::{ShellError, ShellResult};

/// Entry point every application library exports.
pub const MAIN_SYMBOL: &[u8] = b"SwitchyardMain\0";

/// Optional export receiving the [`SystemThunks`] table.
pub const SET_THUNKS_SYMBOL: &[u8] = b"SwitchyardSetSystemThunks\0";

/// `deadline_us` value meaning "wait forever".
pub const INDEFINITE_DEADLINE: u64 = u64::MAX;

type MainFn = unsafe extern "C" fn(u64) -> i32;
type SetThunksFn = unsafe extern "C" fn(*const SystemThunks) -> usize;

/// C-ABI handle operations bound to one [`Core`] through `context`.
///
/// Every function returns a [`ResultCode`] value.
#[repr(C)]
#[derive(Debug)]
pub struct SystemThunks {
    /// Size of this struct, for forward compatibility.
    pub size: usize,
    /// Opaque pointer passed back as the first argument of every thunk.
    pub context: *const c_void,
    /// `close(context, handle)`
    pub close: unsafe extern "C" fn(*const c_void, u64) -> i32,
    /// `write_message(context, handle, bytes, num_bytes, handles, num_handles)`
    pub write_message:
        unsafe extern "C" fn(*const c_void, u64, *const u8, u32, *const u64, u32) -> i32,
    /// `read_message(context, handle, bytes, &num_bytes, handles, &num_handles)`.
    /// On input the counts are capacities; on output, the message's sizes. A
    /// message that does not fit stays queued and `ResourceExhausted` is
    /// returned.
    pub read_message:
        unsafe extern "C" fn(*const c_void, u64, *mut u8, *mut u32, *mut u64, *mut u32) -> i32,
    /// `wait(context, handle, signals, deadline_us)`
    pub wait: unsafe extern "C" fn(*const c_void, u64, u32, u64) -> i32,
}

impl SystemThunks {
    /// A table bound to `core`. Valid only while `core` is alive.
    #[must_use]
    pub fn for_core(core: &Arc<Core>) -> Self {
        Self {
            size: std::mem::size_of::<Self>(),
            context: Arc::as_ptr(core).cast::<c_void>(),
            close: thunk_close,
            write_message: thunk_write_message,
            read_message: thunk_read_message,
            wait: thunk_wait,
        }
    }
}

fn code_of(result: SystemResult<()>) -> i32 {
    match result {
        Ok(()) => ResultCode::Ok.as_i32(),
        Err(e) => e.code().as_i32(),
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// # Safety
///
/// `context` must come from [`SystemThunks::for_core`] with the core alive.
unsafe fn core_from<'a>(context: *const c_void) -> &'a Core {
    // SAFETY: guaranteed by the caller.
    unsafe { &*context.cast::<Core>() }
}

unsafe extern "C" fn thunk_close(context: *const c_void, handle: u64) -> i32 {
    // SAFETY: the table is only handed out bound to a live core.
    let core = unsafe { core_from(context) };
    code_of(core.close(Handle::from_raw(handle)))
}

unsafe extern "C" fn thunk_write_message(
    context: *const c_void,
    handle: u64,
    bytes: *const u8,
    num_bytes: u32,
    handles: *const u64,
    num_handles: u32,
) -> i32 {
    // SAFETY: the table is only handed out bound to a live core.
    let core = unsafe { core_from(context) };
    if (bytes.is_null() && num_bytes > 0) || (handles.is_null() && num_handles > 0) {
        return ResultCode::InvalidArgument.as_i32();
    }
    let payload = if num_bytes == 0 {
        Vec::new()
    } else {
        // SAFETY: the caller passes `num_bytes` readable bytes at `bytes`.
        unsafe { std::slice::from_raw_parts(bytes, num_bytes as usize) }.to_vec()
    };
    let attached: Vec<Handle> = if num_handles == 0 {
        Vec::new()
    } else {
        // SAFETY: the caller passes `num_handles` handles at `handles`.
        unsafe { std::slice::from_raw_parts(handles, num_handles as usize) }
            .iter()
            .map(|raw| Handle::from_raw(*raw))
            .collect()
    };
    code_of(core.write_message(Handle::from_raw(handle), payload, &attached))
}

unsafe extern "C" fn thunk_read_message(
    context: *const c_void,
    handle: u64,
    bytes: *mut u8,
    num_bytes: *mut u32,
    handles: *mut u64,
    num_handles: *mut u32,
) -> i32 {
    // SAFETY: the table is only handed out bound to a live core.
    let core = unsafe { core_from(context) };
    let handle = Handle::from_raw(handle);
    let (needed_bytes, needed_handles) = match core.peek_message_size(handle) {
        Ok(sizes) => sizes,
        Err(e) => return e.code().as_i32(),
    };

    // SAFETY: null count pointers mean zero capacity; non-null ones are
    // valid for reads and writes per the thunk contract.
    let byte_capacity = if num_bytes.is_null() { 0 } else { unsafe { *num_bytes } };
    // SAFETY: as above.
    let handle_capacity = if num_handles.is_null() { 0 } else { unsafe { *num_handles } };
    let write_sizes = |b: usize, h: usize| {
        if !num_bytes.is_null() {
            // SAFETY: checked non-null; valid per the thunk contract.
            unsafe { *num_bytes = to_u32(b) };
        }
        if !num_handles.is_null() {
            // SAFETY: checked non-null; valid per the thunk contract.
            unsafe { *num_handles = to_u32(h) };
        }
    };

    let bytes_fit =
        needed_bytes == 0 || (!bytes.is_null() && needed_bytes <= byte_capacity as usize);
    let handles_fit =
        needed_handles == 0 || (!handles.is_null() && needed_handles <= handle_capacity as usize);
    let fits = bytes_fit && handles_fit;
    if !fits {
        write_sizes(needed_bytes, needed_handles);
        return ResultCode::ResourceExhausted.as_i32();
    }

    let message = match core.read_message(handle) {
        Ok(message) => message,
        Err(e) => return e.code().as_i32(),
    };
    if !message.bytes.is_empty() {
        // SAFETY: `bytes` holds at least `byte_capacity >= needed_bytes` bytes
        // and the message read is the one that was peeked.
        unsafe {
            std::ptr::copy_nonoverlapping(message.bytes.as_ptr(), bytes, message.bytes.len());
        }
    }
    for (i, h) in message.handles.iter().enumerate() {
        // SAFETY: `handles` holds at least `handle_capacity >= needed_handles` slots.
        unsafe { *handles.add(i) = h.as_raw() };
    }
    write_sizes(message.bytes.len(), message.handles.len());
    ResultCode::Ok.as_i32()
}

unsafe extern "C" fn thunk_wait(
    context: *const c_void,
    handle: u64,
    signals: u32,
    deadline_us: u64,
) -> i32 {
    // SAFETY: the table is only handed out bound to a live core.
    let core = unsafe { core_from(context) };
    let deadline = (deadline_us != INDEFINITE_DEADLINE).then(|| Duration::from_micros(deadline_us));
    code_of(
        core.wait(Handle::from_raw(handle), Signals::from_bits_truncate(signals), deadline)
            .map(drop),
    )
}

/// A loaded shared library.
#[derive(Debug)]
pub struct NativeLibrary {
    library: libloading::Library,
    path: PathBuf,
}

impl NativeLibrary {
    /// Load the library at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::LoadFailed`] if the dynamic loader rejects it.
    pub fn open(path: &Path) -> ShellResult<Self> {
        // SAFETY: loading runs the library's initializers; application
        // libraries are trusted code chosen by the shell's configuration.
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| ShellError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "library loaded");
        Ok(Self {
            library,
            path: path.to_path_buf(),
        })
    }

    /// Where the library was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CodeUnit for NativeLibrary {
    fn run(&self, core: &Arc<Core>, application_request: Handle) -> i32 {
        let thunks = SystemThunks::for_core(core);
        // SAFETY: the symbol type matches the documented export signature.
        if let Ok(set_thunks) = unsafe { self.library.get::<SetThunksFn>(SET_THUNKS_SYMBOL) } {
            // SAFETY: `thunks` outlives the call and stays bound to `core`,
            // which outlives the application's entry point.
            let accepted = unsafe { set_thunks(&raw const thunks) };
            debug!(path = %self.path.display(), accepted, "system thunks installed");
        }

        // SAFETY: the symbol type matches the documented export signature.
        match unsafe { self.library.get::<MainFn>(MAIN_SYMBOL) } {
            // SAFETY: calling the application's entry point is the purpose of
            // this code unit; `thunks` is still alive here.
            Ok(main) => unsafe { main(application_request.as_raw()) },
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "library has no SwitchyardMain");
                let _ = core.close(application_request);
                ResultCode::NotFound.as_i32()
            },
        }
    }
}

/// Loads [`NativeLibrary`] code units.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLibraryLoader;

impl CodeUnitLoader for NativeLibraryLoader {
    fn load(&self, path: &Path) -> ShellResult<Arc<dyn CodeUnit>> {
        if !path.exists() {
            return Err(ShellError::AppNotFound(path.to_path_buf()));
        }
        Ok(Arc::new(NativeLibrary::open(path)?))
    }
}

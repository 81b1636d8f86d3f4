//! Keeping the containing code unit loaded while its threads run.
//!
//! When this crate is linked into a shared object that the embedding
//! application loads and unloads at will, every thread the host spawns is
//! running code out of that object. Unloading it underneath a live thread
//! crashes the process. A `ModulePin` holds one load reference for one
//! thread:
//!
//! - it is taken immediately before the thread is spawned, and
//! - it is dropped only after the thread has been joined.
//!
//! Because the release happens on the joining thread, there is no window in
//! which the pinned thread is still alive but its reference already gone.
//!
//! On Linux and macOS the reference is a `dlopen(RTLD_NOLOAD)` of the object
//! containing this module; on Windows it is a `GetModuleHandleExW` reference
//! on the module found from one of its own addresses. Both are held as
//! `libloading` libraries and closed through them. Elsewhere, or when the
//! object cannot be reopened, only the in-process count is kept.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Load-reference tracker for the code unit containing this crate.
#[derive(Debug)]
pub struct ModuleLifetime {
    /// Path of the containing object, when it could be resolved.
    object: Option<PathBuf>,
    /// Outstanding pins.
    pins: AtomicUsize,
}

impl ModuleLifetime {
    /// Track the object this crate was loaded from.
    pub fn current() -> Arc<Self> {
        let object = os::containing_object();
        match &object {
            Some(path) => tracing::debug!("Module lifetime tracks {}", path.display()),
            None => tracing::debug!("Module lifetime could not resolve containing object"),
        }
        Arc::new(Self {
            object,
            pins: AtomicUsize::new(0),
        })
    }

    /// Count pins without touching any loader reference.
    ///
    /// Suitable for statically linked hosts and for tests.
    pub fn untracked() -> Arc<Self> {
        Arc::new(Self {
            object: None,
            pins: AtomicUsize::new(0),
        })
    }

    /// Take one load reference. Call immediately before spawning a thread.
    pub fn pin(self: &Arc<Self>) -> ModulePin {
        let load_ref = self.object.as_deref().and_then(os::acquire);
        self.pins.fetch_add(1, Ordering::AcqRel);
        ModulePin {
            lifetime: Arc::clone(self),
            load_ref,
        }
    }

    /// Number of pins currently held.
    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Path of the tracked object, if any.
    pub fn object_path(&self) -> Option<&Path> {
        self.object.as_deref()
    }

    fn unpin(&self, load_ref: Option<os::LoadRef>) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "module unpinned more often than pinned");
        if let Some(load_ref) = load_ref {
            os::release(load_ref);
        }
    }
}

/// One load reference, released on drop.
#[derive(Debug)]
#[must_use = "dropping a pin releases the load reference immediately"]
pub struct ModulePin {
    lifetime: Arc<ModuleLifetime>,
    load_ref: Option<os::LoadRef>,
}

impl ModulePin {
    /// Whether this pin holds a real loader reference.
    pub fn holds_load_ref(&self) -> bool {
        self.load_ref.is_some()
    }
}

impl Drop for ModulePin {
    fn drop(&mut self) {
        self.lifetime.unpin(self.load_ref.take());
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod os {
    use std::ffi::{c_void, CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    use libloading::os::unix::Library;

    pub(super) type LoadRef = Library;

    pub(super) fn containing_object() -> Option<PathBuf> {
        let anchor = containing_object as fn() -> Option<PathBuf>;
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let found = unsafe { libc::dladdr(anchor as *const c_void, &mut info) };
        if found == 0 || info.dli_fname.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(info.dli_fname) };
        Some(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
    }

    pub(super) fn acquire(path: &Path) -> Option<LoadRef> {
        // RTLD_NOLOAD only bumps the count of an object that is already mapped.
        match unsafe { Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_NOLOAD) } {
            Ok(library) => Some(library),
            Err(err) => {
                tracing::debug!("No load reference on {}: {}", path.display(), err);
                None
            }
        }
    }

    pub(super) fn release(load_ref: LoadRef) {
        if let Err(err) = load_ref.close() {
            tracing::error!("Failed to release module load reference: {}", err);
        }
    }
}

#[cfg(windows)]
mod os {
    use std::ffi::{c_void, OsString};
    use std::os::windows::ffi::OsStringExt;
    use std::path::{Path, PathBuf};
    use std::ptr;

    use libloading::os::windows::Library;
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    pub(super) type LoadRef = Library;

    pub(super) fn containing_object() -> Option<PathBuf> {
        let anchor = containing_object as fn() -> Option<PathBuf>;
        let mut module: HMODULE = ptr::null_mut();
        let found = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS
                    | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                anchor as *const c_void as *const u16,
                &mut module,
            )
        };
        if found == 0 {
            return None;
        }

        let mut buffer = vec![0_u16; 260];
        loop {
            let capacity = u32::try_from(buffer.len()).ok()?;
            let len = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), capacity) } as usize;
            if len == 0 {
                return None;
            }
            // A full buffer means the name was truncated.
            if len < buffer.len() {
                return Some(PathBuf::from(OsString::from_wide(&buffer[..len])));
            }
            buffer.resize(buffer.len() * 2, 0);
        }
    }

    pub(super) fn acquire(path: &Path) -> Option<LoadRef> {
        // Takes a reference on the mapped module without loading anything.
        match Library::open_already_loaded(path) {
            Ok(library) => Some(library),
            Err(err) => {
                tracing::debug!("No load reference on {}: {}", path.display(), err);
                None
            }
        }
    }

    pub(super) fn release(load_ref: LoadRef) {
        if let Err(err) = load_ref.close() {
            tracing::error!("Failed to release module load reference: {}", err);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
mod os {
    use std::path::{Path, PathBuf};

    #[derive(Debug)]
    pub(super) enum LoadRef {}

    pub(super) fn containing_object() -> Option<PathBuf> {
        None
    }

    pub(super) fn acquire(_path: &Path) -> Option<LoadRef> {
        None
    }

    pub(super) fn release(load_ref: LoadRef) {
        match load_ref {}
    }
}

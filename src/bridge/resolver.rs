//! Library Resolver
//!
//! Locates the configured dynamic libraries and discovers the base address
//! the offset arithmetic is applied against. A library that is already
//! resident in the process is preferred over loading a fresh copy: the
//! offset only means anything relative to whichever image is actually
//! mapped.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::{debug, warn};

use super::{BridgeError, BridgeResult};

/// A single library identifier from configuration: either a bare name
/// (searched across platform paths and the system loader) or an explicit
/// path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LibrarySpec(String);

impl LibrarySpec {
    /// Create a spec from a name or path.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier as configured.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_path(&self) -> bool {
        self.0.contains(std::path::MAIN_SEPARATOR) || self.0.starts_with('.')
    }
}

impl fmt::Display for LibrarySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LibrarySpec {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A resolved library: the open handle plus the address facts the offset
/// calculator needs.
///
/// Dropping this closes our handle, which undoes only the reference this
/// bridge itself added. A library that was resident before resolution
/// (`preloaded`) therefore survives unload.
#[derive(Debug)]
pub struct ResolvedLibrary {
    spec: LibrarySpec,
    #[allow(dead_code)]
    library: Library,
    base: usize,
    region: Option<Range<usize>>,
    preloaded: bool,
}

impl ResolvedLibrary {
    /// The spec this library was resolved from.
    pub fn spec(&self) -> &LibrarySpec {
        &self.spec
    }

    /// Load base address of the mapped image.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Extent of the image's loadable segments, when the platform exposes
    /// them.
    pub fn region(&self) -> Option<&Range<usize>> {
        self.region.as_ref()
    }

    /// Whether the library was already mapped before we resolved it.
    pub fn preloaded(&self) -> bool {
        self.preloaded
    }
}

enum ResolveFailure {
    Unsupported,
    Failed(String),
}

/// Resolves ordered library candidates into open handles and base
/// addresses.
pub struct LibraryResolver {
    search_paths: Vec<PathBuf>,
}

impl LibraryResolver {
    /// Create a resolver with the platform default search paths.
    pub fn new() -> Self {
        Self {
            search_paths: platform_search_paths(),
        }
    }

    /// Prepend an additional search path.
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.insert(0, path.as_ref().to_path_buf());
    }

    /// Resolve every candidate in listed order. Individual failures are
    /// logged and skipped; the call fails only when no candidate resolves.
    /// The first resolved entry supplies the base address for offset
    /// computation.
    pub fn resolve_all(&self, specs: &[LibrarySpec]) -> BridgeResult<Vec<ResolvedLibrary>> {
        let mut resolved = Vec::new();
        for spec in specs {
            match self.try_resolve(spec) {
                Ok(lib) => {
                    debug!(
                        library = %spec,
                        preloaded = lib.preloaded,
                        "resolved library at base {:#x}",
                        lib.base
                    );
                    resolved.push(lib);
                }
                Err(ResolveFailure::Unsupported) => return Err(BridgeError::Unsupported),
                Err(ResolveFailure::Failed(msg)) => {
                    warn!(library = %spec, "candidate failed to resolve: {}", msg);
                }
            }
        }
        if resolved.is_empty() {
            return Err(BridgeError::LibraryNotFound {
                tried: specs.iter().map(|s| s.to_string()).collect(),
            });
        }
        Ok(resolved)
    }

    /// Resolve a single candidate.
    pub fn resolve(&self, spec: &LibrarySpec) -> BridgeResult<ResolvedLibrary> {
        self.try_resolve(spec).map_err(|failure| match failure {
            ResolveFailure::Unsupported => BridgeError::Unsupported,
            ResolveFailure::Failed(msg) => {
                warn!(library = %spec, "failed to resolve: {}", msg);
                BridgeError::LibraryNotFound {
                    tried: vec![spec.to_string()],
                }
            }
        })
    }

    #[cfg(target_os = "linux")]
    fn try_resolve(&self, spec: &LibrarySpec) -> Result<ResolvedLibrary, ResolveFailure> {
        use libloading::os::unix;

        // An already-resident image is preferred: probe by name/path without
        // triggering a fresh load.
        let probe = unsafe {
            unix::Library::open(Some(spec.as_str()), libc::RTLD_LAZY | libc::RTLD_NOLOAD)
        };
        let (os_lib, preloaded) = match probe {
            Ok(lib) => (lib, true),
            Err(_) => {
                let path = self.locate(spec);
                // RTLD_GLOBAL so this library's exports can satisfy
                // undefined symbols in the opaque module, matching the
                // loader environment the module was built for.
                let lib = unsafe {
                    unix::Library::open(Some(&path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
                }
                .map_err(|e| {
                    ResolveFailure::Failed(format!("dlopen {}: {}", path.display(), e))
                })?;
                (lib, false)
            }
        };

        let raw = os_lib.into_raw();
        let (base, region) = match module_bounds(raw) {
            Ok(bounds) => bounds,
            Err(msg) => {
                // Close our reference before reporting.
                drop(unsafe { unix::Library::from_raw(raw) });
                return Err(ResolveFailure::Failed(msg));
            }
        };

        let library = Library::from(unsafe { unix::Library::from_raw(raw) });
        Ok(ResolvedLibrary {
            spec: spec.clone(),
            library,
            base,
            region,
            preloaded,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn try_resolve(&self, _spec: &LibrarySpec) -> Result<ResolvedLibrary, ResolveFailure> {
        // Base-address discovery needs the loaded-module list; only the
        // dl_iterate_phdr path is implemented.
        Err(ResolveFailure::Unsupported)
    }

    /// Turn a spec into something the system loader will accept: explicit
    /// paths pass through, bare names are searched across our paths and
    /// otherwise handed to the loader as-is (it has its own cache).
    fn locate(&self, spec: &LibrarySpec) -> PathBuf {
        if spec.is_path() {
            return PathBuf::from(spec.as_str());
        }
        let file_name = expand_library_name(spec.as_str());
        for dir in &self.search_paths {
            let candidate = dir.join(&file_name);
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(spec.as_str())
    }
}

impl Default for LibraryResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Base address and loadable-segment extent for an open handle.
#[cfg(target_os = "linux")]
fn module_bounds(handle: *mut libc::c_void) -> Result<(usize, Option<Range<usize>>), String> {
    // struct link_map from <link.h>; only the leading fields are stable.
    #[repr(C)]
    #[allow(dead_code)]
    struct LinkMap {
        l_addr: libc::uintptr_t,
        l_name: *const libc::c_char,
        l_ld: *mut libc::c_void,
        l_next: *mut LinkMap,
        l_prev: *mut LinkMap,
    }
    const RTLD_DI_LINKMAP: libc::c_int = 2;

    let mut map: *mut LinkMap = std::ptr::null_mut();
    let rc = unsafe {
        libc::dlinfo(
            handle,
            RTLD_DI_LINKMAP,
            &mut map as *mut *mut LinkMap as *mut libc::c_void,
        )
    };
    if rc != 0 || map.is_null() {
        return Err("dlinfo(RTLD_DI_LINKMAP) failed".to_string());
    }
    let base = unsafe { (*map).l_addr };
    if base == 0 {
        return Err("module reports a zero load base".to_string());
    }

    Ok((base, mapped_region(base)))
}

/// Walk the loaded-module list for the entry at `base` and compute the
/// PT_LOAD extent. Absence is not an error; it just disables the bounds
/// check downstream.
#[cfg(target_os = "linux")]
fn mapped_region(base: usize) -> Option<Range<usize>> {
    struct Search {
        base: usize,
        region: Option<Range<usize>>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let search = &mut *(data as *mut Search);
        let info = &*info;
        if info.dlpi_addr as usize != search.base {
            return 0;
        }
        let mut lo = usize::MAX;
        let mut hi = 0usize;
        for i in 0..info.dlpi_phnum as isize {
            let ph = &*info.dlpi_phdr.offset(i);
            if ph.p_type == libc::PT_LOAD {
                lo = lo.min(ph.p_vaddr as usize);
                hi = hi.max(ph.p_vaddr.saturating_add(ph.p_memsz) as usize);
            }
        }
        if hi > lo {
            search.region = Some(search.base + lo..search.base + hi);
        }
        1
    }

    let mut search = Search { base, region: None };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut search as *mut Search as *mut libc::c_void);
    }
    search.region
}

/// Default library search paths for this platform.
fn platform_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            for p in ld_path.split(':').filter(|p| !p.is_empty()) {
                paths.push(PathBuf::from(p));
            }
        }
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/lib64"));
        paths.push(PathBuf::from("/usr/lib64"));
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            for p in dyld_path.split(':').filter(|p| !p.is_empty()) {
                paths.push(PathBuf::from(p));
            }
        }
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("PATH") {
            for p in path.split(';').filter(|p| !p.is_empty()) {
                paths.push(PathBuf::from(p));
            }
        }
    }

    paths
}

/// Expand a bare name into the platform library filename. Names that
/// already look like library files pass through (sonames like
/// `libfoo.so.30` included).
fn expand_library_name(name: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        if name.starts_with("lib") && name.contains(".so") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }

    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") && name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        if name.ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        name.to_string()
    }
}

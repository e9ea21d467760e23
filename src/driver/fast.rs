//! Fast adapter driver backed by the vendor adapter library
//!
//! The library is loaded at runtime from the application bundle. Entry points
//! are resolved through alias lists because shipped builds differ in export
//! capitalisation and stdcall decoration.

use async_trait::async_trait;
use libloading::Library;
use std::ffi::c_void;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{generate_adapter_name, AdapterDriver, AdapterIdentity, DriverKind};
use crate::config::DriverSettings;
use crate::error::DriverError;
use crate::paths::BundleLocator;

const CREATE_ADAPTER: &[&str] = &[
    "WintunCreateAdapter",
    "WinTunCreateAdapter",
    "_WintunCreateAdapter@12",
];
const CLOSE_ADAPTER: &[&str] = &[
    "WintunCloseAdapter",
    "WinTunCloseAdapter",
    "_WintunCloseAdapter@4",
];
const START_SESSION: &[&str] = &[
    "WintunStartSession",
    "WinTunStartSession",
    "_WintunStartSession@8",
];
const END_SESSION: &[&str] = &["WintunEndSession", "WinTunEndSession", "_WintunEndSession@4"];
const DRIVER_VERSION: &[&str] = &[
    "WintunGetRunningDriverVersion",
    "WinTunGetRunningDriverVersion",
    "_WintunGetRunningDriverVersion@0",
];

const HELPER_TIMEOUT: Duration = Duration::from_secs(5);

#[repr(C)]
struct RawGuid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl From<&Uuid> for RawGuid {
    fn from(id: &Uuid) -> Self {
        let (data1, data2, data3, data4) = id.as_fields();
        Self {
            data1,
            data2,
            data3,
            data4: *data4,
        }
    }
}

type CreateAdapterFn = unsafe extern "system" fn(*const u16, *const u16, *const RawGuid) -> *mut c_void;
type CloseAdapterFn = unsafe extern "system" fn(*mut c_void);
type StartSessionFn = unsafe extern "system" fn(*mut c_void, u32) -> *mut c_void;
type EndSessionFn = unsafe extern "system" fn(*mut c_void);
type DriverVersionFn = unsafe extern "system" fn() -> u32;

/// Opaque handle returned by the vendor library
struct RawHandle(*mut c_void);

// Handles are plain tokens owned by this driver; the library allows use from any thread.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

/// Loaded vendor library with its resolved entry points
struct VendorLibrary {
    path: PathBuf,
    create_adapter: CreateAdapterFn,
    close_adapter: CloseAdapterFn,
    start_session: StartSessionFn,
    end_session: Option<EndSessionFn>,
    driver_version: Option<DriverVersionFn>,
    // Keeps the entry points above valid
    _library: Library,
}

impl VendorLibrary {
    fn load(path: &Path) -> Result<Self, String> {
        let library = unsafe { open_library(path) }.map_err(|e| e.to_string())?;

        unsafe {
            let create_adapter = resolve::<CreateAdapterFn>(&library, CREATE_ADAPTER)
                .ok_or_else(|| "create-adapter entry point missing".to_string())?;
            let close_adapter = resolve::<CloseAdapterFn>(&library, CLOSE_ADAPTER)
                .ok_or_else(|| "close-adapter entry point missing".to_string())?;
            let start_session = resolve::<StartSessionFn>(&library, START_SESSION)
                .ok_or_else(|| "start-session entry point missing".to_string())?;

            Ok(Self {
                path: path.to_path_buf(),
                create_adapter,
                close_adapter,
                start_session,
                end_session: resolve::<EndSessionFn>(&library, END_SESSION),
                driver_version: resolve::<DriverVersionFn>(&library, DRIVER_VERSION),
                _library: library,
            })
        }
    }
}

unsafe fn resolve<T: Copy>(library: &Library, aliases: &[&str]) -> Option<T> {
    for alias in aliases {
        if let Ok(symbol) = library.get::<T>(alias.as_bytes()) {
            debug!("Resolved entry point {}", alias);
            return Some(*symbol);
        }
    }
    None
}

#[cfg(windows)]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::windows::{
        Library as WindowsLibrary, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
        LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR, LOAD_WITH_ALTERED_SEARCH_PATH,
    };

    match WindowsLibrary::load_with_flags(
        path,
        LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR | LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
    ) {
        Ok(library) => Ok(library.into()),
        Err(e) => {
            debug!("Search-dir load of {:?} failed ({}), retrying with altered search path", path, e);
            WindowsLibrary::load_with_flags(path, LOAD_WITH_ALTERED_SEARCH_PATH).map(Into::into)
        }
    }
}

#[cfg(not(windows))]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    Library::new(path)
}

#[cfg(windows)]
mod search_path {
    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;
    use std::path::PathBuf;
    use tracing::debug;
    use windows::core::PCWSTR;
    use windows::Win32::System::LibraryLoader::{AddDllDirectory, RemoveDllDirectory};

    /// Directories added to the process DLL search path
    pub(super) struct SearchPathGuard {
        cookies: Vec<usize>,
    }

    impl SearchPathGuard {
        pub(super) fn augment(dirs: &[PathBuf]) -> Self {
            let mut cookies = Vec::new();
            for dir in dirs.iter().filter(|d| d.is_dir()) {
                let wide: Vec<u16> = dir.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
                let cookie = unsafe { AddDllDirectory(PCWSTR(wide.as_ptr())) };
                if !cookie.is_null() {
                    debug!("Added {:?} to DLL search path", dir);
                    cookies.push(cookie as usize);
                }
            }
            Self { cookies }
        }
    }

    impl Drop for SearchPathGuard {
        fn drop(&mut self) {
            for cookie in self.cookies.drain(..) {
                unsafe {
                    let _ = RemoveDllDirectory(cookie as *const c_void);
                }
            }
        }
    }
}

#[cfg(not(windows))]
mod search_path {
    use std::path::PathBuf;

    /// Dependent libraries resolve through the loader's own rpath rules here
    pub(super) struct SearchPathGuard;

    impl SearchPathGuard {
        pub(super) fn augment(_dirs: &[PathBuf]) -> Self {
            Self
        }
    }
}

use search_path::SearchPathGuard;

/// Fast driver backend
pub struct FastDriver {
    settings: DriverSettings,
    locator: BundleLocator,
    library_dirs: Vec<PathBuf>,
    tool_dirs: Vec<PathBuf>,
    session: Option<RawHandle>,
    adapter: Option<RawHandle>,
    helper_adapter: Option<(PathBuf, String)>,
    identity: Option<AdapterIdentity>,
    library: Option<VendorLibrary>,
    search_path: Option<SearchPathGuard>,
}

impl FastDriver {
    pub fn new(
        settings: DriverSettings,
        locator: BundleLocator,
        library_dirs: Vec<PathBuf>,
        tool_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            settings,
            locator,
            library_dirs,
            tool_dirs,
            session: None,
            adapter: None,
            helper_adapter: None,
            identity: None,
            library: None,
            search_path: None,
        }
    }

    /// Platform file name of the vendor library
    pub fn library_file_name(&self) -> String {
        libloading::library_filename(&self.settings.library_name)
            .to_string_lossy()
            .into_owned()
    }

    /// Path the vendor library was loaded from
    pub fn library_path(&self) -> Option<&Path> {
        self.library.as_ref().map(|l| l.path.as_path())
    }

    /// Version reported by the running kernel driver, when the library exports it
    pub fn driver_version(&self) -> Option<u32> {
        let query = self.library.as_ref()?.driver_version?;
        match unsafe { query() } {
            0 => None,
            version => Some(version),
        }
    }

    /// Start a packet session on the provisioned adapter
    pub fn start_session(&mut self) -> Result<(), DriverError> {
        let library = self
            .library
            .as_ref()
            .ok_or_else(|| DriverError::LibraryUnavailable("library not loaded".to_string()))?;
        let adapter = self.adapter.as_ref().ok_or(DriverError::AdapterNotProvisioned)?;
        if self.session.is_some() {
            return Ok(());
        }

        let session = unsafe { (library.start_session)(adapter.0, self.settings.session_capacity) };
        if session.is_null() {
            let os_error_code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            warn!("Failed to start adapter session: os error {}", os_error_code);
            return Err(DriverError::SessionStartFailed { os_error_code });
        }

        debug!("Started adapter session (capacity {:#x})", self.settings.session_capacity);
        self.session = Some(RawHandle(session));
        Ok(())
    }

    /// End the packet session, if any
    pub fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some(end) = self.library.as_ref().and_then(|l| l.end_session) {
                unsafe { end(session.0) };
                debug!("Ended adapter session");
            }
        }
    }

    fn load_library(&mut self) -> bool {
        if self.library.is_some() {
            return true;
        }

        let app_dir = self.locator.app_dir().to_path_buf();
        let guard = SearchPathGuard::augment(&[app_dir.clone(), app_dir.join("bin")]);

        let file_name = self.library_file_name();
        for candidate in self.locator.candidates(&self.library_dirs, &file_name) {
            if !candidate.is_file() {
                continue;
            }
            match VendorLibrary::load(&candidate) {
                Ok(library) => {
                    info!("Loaded adapter library from {:?}", candidate);
                    self.library = Some(library);
                    self.search_path = Some(guard);
                    return true;
                }
                Err(e) => warn!("Failed to load adapter library {:?}: {}", candidate, e),
            }
        }

        debug!("Adapter library {} not loadable from any candidate", file_name);
        false
    }

    /// Create the adapter with the bundled helper.
    ///
    /// Returns the GUID the helper printed, or `fallback_id` when it printed
    /// none. `None` means the helper is absent or failed.
    async fn create_with_helper(&mut self, name: &str, fallback_id: Uuid) -> Option<Uuid> {
        let helper = self.settings.adapter_helper.clone()?;
        let file_name = format!("{}{}", helper, std::env::consts::EXE_SUFFIX);
        let path = self.locator.find(&self.tool_dirs, &file_name)?;

        let args = [
            "create",
            "--hwid",
            self.settings.helper_hardware_id.as_str(),
            "--name",
            name,
        ];
        let output = run_helper(&path, &args, self.locator.app_dir()).await?;
        info!("Adapter {} created with {:?}", name, path);
        self.helper_adapter = Some((path, name.to_string()));

        Some(parse_adapter_guid(&output).unwrap_or_else(|| {
            debug!("Helper printed no GUID for {}, using generated id", name);
            fallback_id
        }))
    }

    fn create_with_library(&mut self, name: &str, unique_id: &Uuid) -> Result<(), DriverError> {
        let library = self
            .library
            .as_ref()
            .ok_or_else(|| DriverError::LibraryUnavailable("library not loaded".to_string()))?;

        let wide_name = to_wide(name);
        let wide_type = to_wide(&self.settings.tunnel_type);
        let guid = RawGuid::from(unique_id);

        let handle = unsafe { (library.create_adapter)(wide_name.as_ptr(), wide_type.as_ptr(), &guid) };
        if handle.is_null() {
            let os_error_code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            warn!("Failed to create adapter {}: os error {}", name, os_error_code);
            return Err(DriverError::AdapterCreateFailed { os_error_code });
        }

        self.adapter = Some(RawHandle(handle));
        Ok(())
    }

    fn close_handles(&mut self) {
        self.end_session();
        if let Some(adapter) = self.adapter.take() {
            if let Some(library) = self.library.as_ref() {
                unsafe { (library.close_adapter)(adapter.0) };
                debug!("Closed adapter handle");
            }
        }
    }
}

#[async_trait]
impl AdapterDriver for FastDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Fast
    }

    async fn is_available(&mut self) -> bool {
        self.load_library()
    }

    async fn provision(&mut self, preferred_name: Option<String>) -> Result<AdapterIdentity, DriverError> {
        if !self.load_library() {
            return Err(DriverError::LibraryUnavailable(format!(
                "{} not found or not loadable",
                self.library_file_name()
            )));
        }
        if self.identity.is_some() {
            self.teardown().await;
        }

        let name = preferred_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| generate_adapter_name(&self.settings.adapter_name));
        let generated = Uuid::new_v4();

        let unique_id = match self.create_with_helper(&name, generated).await {
            Some(id) => id,
            None => {
                self.create_with_library(&name, &generated)?;
                generated
            }
        };

        let identity = AdapterIdentity {
            display_name: name,
            unique_id,
            backend: DriverKind::Fast,
        };
        info!("Provisioned fast adapter {} ({})", identity.display_name, identity.unique_id);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    async fn teardown(&mut self) {
        self.close_handles();
        if let Some((helper, name)) = self.helper_adapter.take() {
            run_helper(&helper, &["delete", name.as_str()], self.locator.app_dir()).await;
        }
        if let Some(identity) = self.identity.take() {
            info!("Released fast adapter {}", identity.display_name);
        }
    }

    fn identity(&self) -> Option<AdapterIdentity> {
        self.identity.clone()
    }
}

impl Drop for FastDriver {
    fn drop(&mut self) {
        // Handles must be closed while the library is still mapped
        self.close_handles();

        // Nothing to await on here, so the helper delete runs detached
        if let Some((helper, name)) = self.helper_adapter.take() {
            let spawned = std::process::Command::new(&helper)
                .args(["delete", name.as_str()])
                .current_dir(self.locator.app_dir())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            match spawned {
                Ok(_) => debug!("Started {:?} delete {} on drop", helper, name),
                Err(e) => warn!("Adapter {} left behind, failed to run {:?}: {}", name, helper, e),
            }
        }
    }
}

/// Run the helper with a bounded wait; stdout on success
async fn run_helper(path: &Path, args: &[&str], working_dir: &Path) -> Option<String> {
    let mut command = Command::new(path);
    command
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(HELPER_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            warn!("{:?} {} exited with {}", path, args.join(" "), output.status);
            None
        }
        Ok(Err(e)) => {
            warn!("Failed to run {:?}: {}", path, e);
            None
        }
        Err(_) => {
            warn!("Timeout waiting for {:?}", path);
            None
        }
    }
}

/// First GUID in helper output, braced or not
fn parse_adapter_guid(output: &str) -> Option<Uuid> {
    output
        .split_whitespace()
        .map(|token| token.trim_matches(|c| c == '{' || c == '}'))
        .find_map(|token| Uuid::parse_str(token).ok())
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

//! Privilege checks and elevated helper execution
//!
//! The tunnel process needs the same low-level adapter access as the caller,
//! so launching only checks elevation. Driver installation is different: it
//! runs bundled tooling through the OS elevation mechanism (`runas` on
//! Windows, `pkexec` elsewhere) and waits a bounded time for it to finish.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DriverError;

/// Elevation facility used by the drivers and the process supervisor
#[async_trait]
pub trait Elevation: Send + Sync {
    /// Whether the current process already runs elevated
    fn is_elevated(&self) -> bool;

    /// Run `program` elevated, wait up to `timeout`, and return its exit code
    async fn run_elevated(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<i32, DriverError>;
}

/// Elevation through the host operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemElevation;

#[async_trait]
impl Elevation for SystemElevation {
    fn is_elevated(&self) -> bool {
        process_is_elevated()
    }

    async fn run_elevated(
        &self,
        program: &Path,
        args: &[String],
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<i32, DriverError> {
        info!("Running elevated: {:?} {}", program, args.join(" "));

        #[cfg(windows)]
        {
            let program = program.to_path_buf();
            let args = args.to_vec();
            let working_dir = working_dir.to_path_buf();
            tokio::task::spawn_blocking(move || {
                shell::execute_elevated(&program, &args, &working_dir, timeout)
            })
            .await
            .map_err(|e| DriverError::AdapterEnumerationFailed(format!("elevation task failed: {}", e)))?
        }

        #[cfg(not(windows))]
        {
            run_with_pkexec(self.is_elevated(), program, args, working_dir, timeout).await
        }
    }
}

/// Quote one argument for a Windows command line
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

#[cfg(unix)]
fn process_is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(windows)]
fn process_is_elevated() -> bool {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token = HANDLE::default();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token).is_err() {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION::default();
        let mut returned = 0u32;
        let queried = GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut TOKEN_ELEVATION as *mut core::ffi::c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
        .is_ok();
        let _ = CloseHandle(token);

        queried && elevation.TokenIsElevated != 0
    }
}

#[cfg(not(any(unix, windows)))]
fn process_is_elevated() -> bool {
    false
}

#[cfg(not(windows))]
async fn run_with_pkexec(
    already_elevated: bool,
    program: &Path,
    args: &[String],
    working_dir: &Path,
    timeout: Duration,
) -> Result<i32, DriverError> {
    use tokio::process::Command;

    let mut command = if already_elevated {
        let mut command = Command::new(program);
        command.args(args);
        command
    } else {
        let mut command = Command::new("pkexec");
        command.arg(program).args(args);
        command
    };
    command
        .current_dir(working_dir)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        warn!("Failed to start elevated command {:?}: {}", program, e);
        DriverError::ElevationDenied
    })?;

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            warn!("Error waiting for elevated command: {}", e);
            return Err(DriverError::InstallerExecutionFailed { exit_code: -1 });
        }
        Err(_) => {
            warn!("Timeout waiting for elevated command {:?}", program);
            let _ = child.start_kill();
            return Err(DriverError::InstallerTimedOut {
                seconds: timeout.as_secs(),
            });
        }
    };

    let code = status.code().unwrap_or(-1);
    debug!("Elevated command {:?} exited with {}", program, code);

    // pkexec: 126 = authorization dismissed, 127 = not authorized
    if !already_elevated && (code == 126 || code == 127) {
        return Err(DriverError::ElevationDenied);
    }
    Ok(code)
}

#[cfg(windows)]
mod shell {
    use std::path::Path;
    use std::time::Duration;
    use tracing::{debug, warn};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, ERROR_CANCELLED, WAIT_OBJECT_0};
    use windows::Win32::System::Threading::{GetExitCodeProcess, WaitForSingleObject};
    use windows::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use windows::Win32::UI::WindowsAndMessaging::SW_HIDE;

    use super::quote_arg;
    use crate::error::DriverError;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub(super) fn execute_elevated(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        timeout: Duration,
    ) -> Result<i32, DriverError> {
        let verb = wide("runas");
        let file = wide(&program.to_string_lossy());
        let params = wide(
            &args
                .iter()
                .map(|a| quote_arg(a))
                .collect::<Vec<_>>()
                .join(" "),
        );
        let directory = wide(&working_dir.to_string_lossy());

        let mut info = SHELLEXECUTEINFOW {
            cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
            fMask: SEE_MASK_NOCLOSEPROCESS,
            lpVerb: PCWSTR(verb.as_ptr()),
            lpFile: PCWSTR(file.as_ptr()),
            lpParameters: PCWSTR(params.as_ptr()),
            lpDirectory: PCWSTR(directory.as_ptr()),
            nShow: SW_HIDE.0,
            ..Default::default()
        };

        unsafe {
            if let Err(e) = ShellExecuteExW(&mut info) {
                warn!("ShellExecuteEx failed for {:?}: {}", program, e);
                if e.code() == ERROR_CANCELLED.to_hresult() {
                    return Err(DriverError::ElevationDenied);
                }
                return Err(DriverError::InstallerExecutionFailed {
                    exit_code: e.code().0,
                });
            }

            if info.hProcess.is_invalid() {
                return Ok(0);
            }

            let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            let waited = WaitForSingleObject(info.hProcess, millis);
            let mut code = 0u32;
            let status = GetExitCodeProcess(info.hProcess, &mut code);
            let _ = CloseHandle(info.hProcess);

            if waited != WAIT_OBJECT_0 {
                return Err(DriverError::InstallerTimedOut {
                    seconds: timeout.as_secs(),
                });
            }
            if status.is_err() {
                return Err(DriverError::InstallerExecutionFailed { exit_code: -1 });
            }

            debug!("Elevated {:?} exited with {}", program, code);
            Ok(code as i32)
        }
    }
}

//! OS start-up integration: Windows service registration and per-user
//! auto-start. Peripheral glue around the collector core; other platforms
//! report the flags as unsupported and exit non-zero.

use crate::error::Result;

pub const SERVICE_NAME: &str = "ZkCollector";
pub const DISPLAY_NAME: &str = "ZK Attendance Collector";

pub fn install_service() -> Result<()> {
    platform::install_service()
}

pub fn uninstall_service() -> Result<()> {
    platform::uninstall_service()
}

pub fn enable_auto_start() -> Result<()> {
    platform::enable_auto_start()
}

pub fn disable_auto_start() -> Result<()> {
    platform::disable_auto_start()
}

#[cfg(windows)]
mod platform {
    use std::process::Command;

    use super::{DISPLAY_NAME, SERVICE_NAME};
    use crate::error::{AppError, Result};

    const RUN_KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Run";

    fn run(program: &str, args: &[&str]) -> Result<()> {
        let status = Command::new(program).args(args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(AppError::config(format!("{program} exited with {status}")))
        }
    }

    fn exe_path() -> Result<String> {
        Ok(std::env::current_exe()?.display().to_string())
    }

    pub fn install_service() -> Result<()> {
        let exe = exe_path()?;
        run(
            "sc",
            &[
                "create",
                SERVICE_NAME,
                "binPath=",
                &format!("\"{exe}\" --minimized"),
                "start=",
                "auto",
                "DisplayName=",
                DISPLAY_NAME,
            ],
        )
    }

    pub fn uninstall_service() -> Result<()> {
        run("sc", &["delete", SERVICE_NAME])
    }

    pub fn enable_auto_start() -> Result<()> {
        let exe = exe_path()?;
        run(
            "reg",
            &[
                "add",
                RUN_KEY,
                "/v",
                SERVICE_NAME,
                "/t",
                "REG_SZ",
                "/d",
                &format!("\"{exe}\" --minimized"),
                "/f",
            ],
        )
    }

    pub fn disable_auto_start() -> Result<()> {
        run("reg", &["delete", RUN_KEY, "/v", SERVICE_NAME, "/f"])
    }
}

#[cfg(not(windows))]
mod platform {
    use crate::error::{AppError, Result};

    fn unsupported(what: &str) -> AppError {
        AppError::config(format!(
            "{what} is only available on Windows; use your init system (e.g. a systemd unit) instead"
        ))
    }

    pub fn install_service() -> Result<()> {
        Err(unsupported("--install-service"))
    }

    pub fn uninstall_service() -> Result<()> {
        Err(unsupported("--uninstall-service"))
    }

    pub fn enable_auto_start() -> Result<()> {
        Err(unsupported("--enable-autostart"))
    }

    pub fn disable_auto_start() -> Result<()> {
        Err(unsupported("--disable-autostart"))
    }
}

use std::env;

use crate::error::DeskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostOs {
    Windows,
    MacOs,
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostArch {
    X64,
    Arm64,
}

/// Operating system and architecture, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Platform {
    pub(crate) os: HostOs,
    pub(crate) arch: HostArch,
}

impl Platform {
    pub(crate) fn current() -> Result<Self, DeskError> {
        Self::from_consts(env::consts::OS, env::consts::ARCH)
    }

    pub(crate) fn from_consts(os: &str, arch: &str) -> Result<Self, DeskError> {
        let os = match os {
            "windows" => HostOs::Windows,
            "macos" => HostOs::MacOs,
            "linux" => HostOs::Linux,
            value => {
                return Err(DeskError::Config(format!(
                    "unsupported operating system: {value}; supported: windows, macos, linux"
                )))
            }
        };
        let arch = match arch {
            "x86_64" => HostArch::X64,
            "aarch64" => HostArch::Arm64,
            value => {
                return Err(DeskError::Config(format!(
                    "unsupported architecture: {value}; supported: x86_64, aarch64"
                )))
            }
        };
        Ok(Self { os, arch })
    }

    /// Directory under `<resources>/bin` that holds this platform's binaries.
    pub(crate) fn bin_dir_name(&self) -> &'static str {
        match (self.os, self.arch) {
            (HostOs::Windows, _) => "win",
            (HostOs::MacOs, HostArch::Arm64) => "mac-arm64",
            (HostOs::MacOs, HostArch::X64) => "mac-x64",
            (HostOs::Linux, _) => "linux",
        }
    }

    pub(crate) fn exe_name(&self, base: &str) -> String {
        match self.os {
            HostOs::Windows => format!("{base}.exe"),
            _ => base.to_string(),
        }
    }

    /// npm writes `.cmd` shims on Windows and plain scripts elsewhere.
    pub(crate) fn script_name(&self, base: &str) -> String {
        match self.os {
            HostOs::Windows => format!("{base}.cmd"),
            _ => base.to_string(),
        }
    }

    pub(crate) fn is_windows(&self) -> bool {
        self.os == HostOs::Windows
    }

    pub(crate) fn label(&self) -> String {
        let os = match self.os {
            HostOs::Windows => "windows",
            HostOs::MacOs => "macos",
            HostOs::Linux => "linux",
        };
        let arch = match self.arch {
            HostArch::X64 => "x64",
            HostArch::Arm64 => "arm64",
        };
        format!("{os}-{arch}")
    }
}

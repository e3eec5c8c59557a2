use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{DependencyConfig, LaunchMode};
use crate::error::DeskError;
use crate::platform::{HostOs, Platform};
use crate::runner::{prepend_search_path, render_command, spawn_error, CommandRunner};
use crate::splash::StatusSink;

/// Where the CLI dependency lives inside its npm prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstallLayout {
    pub(crate) root: PathBuf,
    pub(crate) bin_dir: PathBuf,
    pub(crate) subdirs: Vec<PathBuf>,
    pub(crate) executable: PathBuf,
}

impl InstallLayout {
    pub(crate) fn new(root: &Path, executable: &str, platform: &Platform) -> Self {
        // npm's global prefix layout differs: Windows puts shims in the prefix itself.
        if platform.is_windows() {
            Self {
                root: root.to_path_buf(),
                bin_dir: root.to_path_buf(),
                subdirs: vec![root.join("node_modules")],
                executable: root.join(platform.script_name(executable)),
            }
        } else {
            Self {
                root: root.to_path_buf(),
                bin_dir: root.join("bin"),
                subdirs: vec![root.join("bin"), root.join("lib")],
                executable: root.join("bin").join(platform.script_name(executable)),
            }
        }
    }

    pub(crate) fn prepare(&self) -> Result<(), DeskError> {
        fs::create_dir_all(&self.root)?;
        for dir in &self.subdirs {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.executable.is_file()
    }
}

/// The npm executable used for installs and the directory holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackageRuntime {
    pub(crate) npm: PathBuf,
    pub(crate) bin_dir: PathBuf,
}

pub(crate) fn bundled_npm_path(resources_dir: &Path, platform: &Platform) -> PathBuf {
    let node_dir = resources_dir.join("node");
    if platform.is_windows() {
        node_dir.join("npm.cmd")
    } else {
        node_dir.join("bin").join("npm")
    }
}

pub(crate) fn locate_runtime(
    mode: LaunchMode,
    resources_dir: &Path,
    platform: &Platform,
) -> Result<PackageRuntime, DeskError> {
    let npm = if mode.is_packaged() {
        let bundled = bundled_npm_path(resources_dir, platform);
        if !bundled.is_file() {
            return Err(DeskError::RuntimeMissing(format!(
                "bundled npm not found at {}",
                bundled.display()
            )));
        }
        bundled
    } else {
        which::which("npm").map_err(|err| {
            DeskError::RuntimeMissing(format!("npm is not on PATH ({err})"))
        })?
    };
    let bin_dir = npm
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(PackageRuntime { npm, bin_dir })
}

/// Opens an interactive terminal running the CLI so the user can sign in.
pub(crate) trait TerminalLauncher {
    fn open(&self, executable: &Path) -> Result<(), DeskError>;
}

pub(crate) struct SystemTerminal {
    pub(crate) platform: Platform,
}

const LINUX_TERMINALS: [&str; 4] = ["x-terminal-emulator", "gnome-terminal", "konsole", "xterm"];

fn shell_single_quote(value: &str) -> String {
    let mut out = String::new();
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn applescript_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn terminal_command(
    platform: &Platform,
    executable: &Path,
    find: impl Fn(&str) -> Option<PathBuf>,
) -> Result<(PathBuf, Vec<String>), DeskError> {
    let exe = executable.to_string_lossy().to_string();
    match platform.os {
        HostOs::MacOs => {
            let script = applescript_string(&shell_single_quote(&exe));
            Ok((
                PathBuf::from("osascript"),
                vec![
                    "-e".to_string(),
                    format!("tell application \"Terminal\" to do script {script}"),
                    "-e".to_string(),
                    "tell application \"Terminal\" to activate".to_string(),
                ],
            ))
        }
        HostOs::Windows => Ok((
            PathBuf::from("cmd"),
            vec![
                "/C".to_string(),
                "start".to_string(),
                // Empty window title; std quotes an empty argument as "".
                String::new(),
                "cmd".to_string(),
                "/K".to_string(),
                exe,
            ],
        )),
        HostOs::Linux => {
            for name in LINUX_TERMINALS {
                if let Some(path) = find(name) {
                    let args = if name == "gnome-terminal" {
                        vec!["--".to_string(), exe]
                    } else {
                        vec!["-e".to_string(), exe]
                    };
                    return Ok((path, args));
                }
            }
            Err(DeskError::TerminalLaunchFailed(format!(
                "no terminal emulator found on PATH (tried {})",
                LINUX_TERMINALS.join(", ")
            )))
        }
    }
}

impl TerminalLauncher for SystemTerminal {
    fn open(&self, executable: &Path) -> Result<(), DeskError> {
        let (program, args) =
            terminal_command(&self.platform, executable, |name| which::which(name).ok())?;
        let command = render_command(&program, &args);
        log::info!("opening sign-in terminal: {command}");
        Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|err| DeskError::TerminalLaunchFailed(format!("{command}: {err}")))
    }
}

/// Anything that can hand the coordinator a usable CLI executable.
pub(crate) trait DependencyProvider {
    fn ensure(&self, status: &mut dyn StatusSink) -> Result<PathBuf, DeskError>;
}

pub(crate) struct DependencyInstaller<R: CommandRunner, T: TerminalLauncher> {
    settings: DependencyConfig,
    layout: InstallLayout,
    auth_marker: PathBuf,
    mode: LaunchMode,
    resources_dir: PathBuf,
    platform: Platform,
    runner: R,
    terminal: T,
}

impl<R: CommandRunner, T: TerminalLauncher> DependencyInstaller<R, T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: DependencyConfig,
        cache_root: &Path,
        auth_marker: PathBuf,
        mode: LaunchMode,
        resources_dir: PathBuf,
        platform: Platform,
        runner: R,
        terminal: T,
    ) -> Self {
        let layout = InstallLayout::new(cache_root, &settings.executable, &platform);
        Self {
            settings,
            layout,
            auth_marker,
            mode,
            resources_dir,
            platform,
            runner,
            terminal,
        }
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.auth_marker.exists()
    }

    fn install_env(&self, runtime: &PackageRuntime) -> BTreeMap<String, OsString> {
        let mut envs = BTreeMap::new();
        envs.insert(
            "NPM_CONFIG_PREFIX".to_string(),
            self.layout.root.clone().into_os_string(),
        );
        envs.insert("npm_config_update_notifier".to_string(), "false".into());
        envs.insert("npm_config_fund".to_string(), "false".into());
        envs.insert(
            "PATH".to_string(),
            prepend_search_path(
                &[runtime.bin_dir.clone(), self.layout.bin_dir.clone()],
                env::var_os("PATH"),
            ),
        );
        envs
    }

    fn install(&self, status: &mut dyn StatusSink) -> Result<(), DeskError> {
        status.update("Locating package manager…");
        let runtime = locate_runtime(self.mode, &self.resources_dir, &self.platform)?;
        let envs = self.install_env(&runtime);
        let spec = self.settings.install_spec();
        let args = vec!["install".to_string(), "--global".to_string(), spec.clone()];
        let command = render_command(&runtime.npm, &args);

        status.update(&format!("Installing {spec}…"));
        let output = self
            .runner
            .run(&runtime.npm, &args, &envs)
            .map_err(|err| spawn_error(&err, &command))?;
        if !output.success() {
            return Err(DeskError::InstallFailed {
                package: spec,
                status_code: output.status_code,
                output: output.combined_text(),
            });
        }

        if !self.layout.is_installed() {
            return Err(DeskError::ExecutableNotFound(
                self.layout.executable.display().to_string(),
            ));
        }

        status.update(&format!("Verifying {}…", self.settings.executable));
        let version_args = vec!["--version".to_string()];
        let executable = self.layout.executable.display().to_string();
        let output = self
            .runner
            .run(&self.layout.executable, &version_args, &envs)
            .map_err(|err| DeskError::VersionCheckFailed {
                executable: executable.clone(),
                output: err.to_string(),
            })?;
        if !output.success() {
            return Err(DeskError::VersionCheckFailed {
                executable,
                output: output.combined_text(),
            });
        }
        log::info!(
            "installed {} {}",
            self.settings.package,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    /// Opens the sign-in terminal when the marker is missing, then watches the marker for
    /// a bounded time. Returns whether the marker exists afterwards.
    pub(crate) fn ensure_authenticated(&self, status: &mut dyn StatusSink) -> bool {
        if self.is_authenticated() {
            return true;
        }
        status.update("Opening a terminal to sign in to Gemini…");
        if let Err(err) = self.terminal.open(&self.layout.executable) {
            log::warn!("{err}");
            return false;
        }

        let wait = Duration::from_millis(self.settings.auth_wait_ms);
        let poll = Duration::from_millis(self.settings.auth_poll_ms.max(1));
        let deadline = Instant::now() + wait;
        loop {
            if self.is_authenticated() {
                log::info!("sign-in detected at {}", self.auth_marker.display());
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(poll.min(deadline - now));
        }
        log::warn!(
            "sign-in not detected after {}ms; continuing without it",
            self.settings.auth_wait_ms
        );
        false
    }
}

impl<R: CommandRunner, T: TerminalLauncher> DependencyProvider for DependencyInstaller<R, T> {
    fn ensure(&self, status: &mut dyn StatusSink) -> Result<PathBuf, DeskError> {
        status.update("Checking gemini-cli…");
        self.layout.prepare()?;
        if self.layout.is_installed() {
            log::info!(
                "reusing {} at {}",
                self.settings.package,
                self.layout.executable.display()
            );
        } else {
            self.install(status)?;
        }
        self.ensure_authenticated(status);
        Ok(self.layout.executable.clone())
    }
}

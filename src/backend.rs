use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::config::{ensure_parent, BackendConfig, ResolvedPaths};
use crate::error::DeskError;
use crate::platform::Platform;
use crate::runner::{prepend_search_path, render_command};

/// A running backend. Owned by exactly one coordinator.
pub(crate) trait BackendProcess: Send {
    fn id(&self) -> u32;
    /// `Some(code)` once the process has exited. Signal deaths map to `128 + signal`.
    fn try_wait(&mut self) -> Result<Option<i32>, DeskError>;
    fn terminate(&mut self) -> Result<(), DeskError>;
    fn kill(&mut self) -> Result<(), DeskError>;
    fn wait(&mut self) -> Result<i32, DeskError>;
}

pub(crate) trait BackendSpawner {
    fn spawn(&self, dependency: &Path) -> Result<Box<dyn BackendProcess>, DeskError>;
}

/// Everything needed to start the backend, computed before anything is spawned.
#[derive(Debug, Clone)]
pub(crate) struct BackendLaunch {
    pub(crate) executable: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) envs: BTreeMap<String, OsString>,
    pub(crate) log_file: Option<PathBuf>,
}

pub(crate) struct SystemSpawner {
    settings: BackendConfig,
    paths: ResolvedPaths,
    resources_dir: PathBuf,
    platform: Platform,
}

impl SystemSpawner {
    pub(crate) fn new(
        settings: BackendConfig,
        paths: ResolvedPaths,
        resources_dir: PathBuf,
        platform: Platform,
    ) -> Self {
        Self {
            settings,
            paths,
            resources_dir,
            platform,
        }
    }

    pub(crate) fn executable(&self) -> PathBuf {
        backend_executable(&self.settings, &self.resources_dir, &self.platform)
    }

    pub(crate) fn plan(&self, dependency: &Path) -> Result<BackendLaunch, DeskError> {
        let executable = self.executable();
        if !executable.is_file() {
            return Err(DeskError::Process(format!(
                "backend executable not found at {}",
                executable.display()
            )));
        }
        fs::create_dir_all(&self.paths.generations_dir)?;

        let mut envs = BTreeMap::new();
        let dependency_dir = dependency
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        envs.insert(
            "PATH".to_string(),
            prepend_search_path(&[dependency_dir], env::var_os("PATH")),
        );
        envs.insert(
            "HOME".to_string(),
            env::var_os("HOME").unwrap_or_else(|| self.paths.home.clone().into_os_string()),
        );
        for key in ["TMPDIR", "TEMP", "TMP"] {
            envs.insert(
                key.to_string(),
                env::var_os(key).unwrap_or_else(|| env::temp_dir().into_os_string()),
            );
        }
        envs.insert(
            self.settings.dependency_env.clone(),
            dependency.as_os_str().to_os_string(),
        );
        envs.insert("HOST".to_string(), self.settings.host.clone().into());
        envs.insert("PORT".to_string(), self.settings.port.to_string().into());
        envs.insert(
            "GENERATIONS_DIR".to_string(),
            self.paths.generations_dir.clone().into_os_string(),
        );

        Ok(BackendLaunch {
            executable,
            args: self.settings.args.clone(),
            envs,
            log_file: self.paths.backend_log_file.clone(),
        })
    }
}

pub(crate) fn backend_executable(
    settings: &BackendConfig,
    resources_dir: &Path,
    platform: &Platform,
) -> PathBuf {
    let override_path = settings.executable.trim();
    if !override_path.is_empty() {
        return PathBuf::from(override_path);
    }
    resources_dir
        .join("bin")
        .join(platform.bin_dir_name())
        .join(platform.exe_name("backend"))
}

impl BackendSpawner for SystemSpawner {
    fn spawn(&self, dependency: &Path) -> Result<Box<dyn BackendProcess>, DeskError> {
        let launch = self.plan(dependency)?;
        let child = spawn_backend(&launch)?;
        log::info!(
            "backend started (pid {}) on {}",
            child.id(),
            self.settings.address()
        );
        Ok(Box::new(child))
    }
}

fn spawn_backend(launch: &BackendLaunch) -> Result<ChildProcess, DeskError> {
    let command_line = render_command(&launch.executable, &launch.args);
    let mut cmd = Command::new(&launch.executable);
    cmd.args(&launch.args).envs(&launch.envs).stdin(Stdio::null());
    match &launch.log_file {
        Some(path) => {
            ensure_parent(path)?;
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            cmd.stdout(Stdio::from(file.try_clone()?));
            cmd.stderr(Stdio::from(file));
        }
        None => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd.spawn().map_err(|err| {
        DeskError::Process(format!("failed to start backend `{command_line}`: {err}"))
    })?;
    Ok(ChildProcess { child })
}

pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

struct ChildProcess {
    child: Child,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> Result<(), DeskError> {
    let group = -(pid as libc::pid_t);
    // SAFETY: kill(2) has no memory-safety requirements.
    let rc = unsafe { libc::kill(group, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(DeskError::Process(format!(
        "failed to signal backend process group {pid}: {err}"
    )))
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> Result<(), DeskError> {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        cmd.arg("/F");
    }
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|err| DeskError::Process(format!("failed to run taskkill: {err}")))?;
    if !status.success() {
        log::debug!("taskkill for pid {pid} exited with {status}");
    }
    Ok(())
}

#[cfg(unix)]
fn request_stop(child: &mut Child) -> Result<(), DeskError> {
    signal_group(child.id(), libc::SIGTERM)
}

#[cfg(unix)]
fn force_stop(child: &mut Child) -> Result<(), DeskError> {
    signal_group(child.id(), libc::SIGKILL)
}

#[cfg(windows)]
fn request_stop(child: &mut Child) -> Result<(), DeskError> {
    taskkill(child.id(), false)
}

#[cfg(windows)]
fn force_stop(child: &mut Child) -> Result<(), DeskError> {
    taskkill(child.id(), true)?;
    match child.kill() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl BackendProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, DeskError> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn terminate(&mut self) -> Result<(), DeskError> {
        request_stop(&mut self.child)
    }

    fn kill(&mut self) -> Result<(), DeskError> {
        force_stop(&mut self.child)
    }

    fn wait(&mut self) -> Result<i32, DeskError> {
        Ok(exit_code(self.child.wait()?))
    }
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::ensure_parent;
use crate::error::DeskError;

pub(crate) fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), DeskError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "geminidesk".to_string()),
        std::process::id(),
        ts
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub(crate) fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

#[cfg(unix)]
pub(crate) fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub(crate) fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// A pid written to disk for the lifetime of the value.
#[derive(Debug)]
pub(crate) struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    pub(crate) fn create(path: PathBuf, pid: u32) -> Result<Self, DeskError> {
        write_atomic_text_file(&path, &format!("{pid}\n"))?;
        Ok(Self { path, pid })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Leave the file alone if another process has since claimed it.
        if read_pid_file(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

static CLAIM_SEQ: AtomicU64 = AtomicU64::new(0);

/// Creates `path` containing `pid` unless it already exists. The pid is written to a
/// private file first and hard-linked into place, so readers never see a partial file.
fn claim_pid_file(path: &Path, pid: u32) -> Result<bool, DeskError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = parent.join(format!(
        ".{}.claim.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "geminidesk".to_string()),
        std::process::id(),
        CLAIM_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp_path, format!("{pid}\n"))?;
    let linked = fs::hard_link(&tmp_path, path);
    let _ = fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Guarantees at most one launcher per state directory.
#[derive(Debug)]
pub(crate) struct InstanceLock {
    file: PidFile,
}

impl InstanceLock {
    pub(crate) fn acquire(path: PathBuf) -> Result<Self, DeskError> {
        let pid = std::process::id();
        for _ in 0..3 {
            if claim_pid_file(&path, pid)? {
                return Ok(Self {
                    file: PidFile { path, pid },
                });
            }
            match read_pid_file(&path) {
                Some(holder) if holder != pid && process_is_alive(holder) => {
                    return Err(DeskError::AlreadyRunning(holder));
                }
                holder => {
                    log::info!(
                        "removing stale instance file {} (pid {})",
                        path.display(),
                        holder
                            .map(|found| found.to_string())
                            .unwrap_or_else(|| "unreadable".to_string())
                    );
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Err(DeskError::Lifecycle(format!(
            "could not claim instance file {}",
            path.display()
        )))
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Asks a running launcher to shut down.
#[cfg(unix)]
pub(crate) fn request_shutdown(pid: u32) -> Result<(), DeskError> {
    // SAFETY: kill(2) has no memory-safety requirements.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    Err(DeskError::Process(format!(
        "failed to signal launcher pid {pid}: {}",
        std::io::Error::last_os_error()
    )))
}

/// Windows has no SIGTERM; the launcher and its backend tree are ended together.
#[cfg(windows)]
pub(crate) fn request_shutdown(pid: u32) -> Result<(), DeskError> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()
        .map_err(|err| DeskError::Process(format!("failed to run taskkill: {err}")))?;
    if !status.success() {
        return Err(DeskError::Process(format!(
            "taskkill for launcher pid {pid} exited with {status}"
        )));
    }
    Ok(())
}

pub(crate) fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_is_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    !process_is_alive(pid)
}

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{DeskError, ProcessErrorDetails};

#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) status_code: i32,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.status_code == 0
    }

    /// Captured stdout and stderr, trimmed and joined for error messages.
    pub(crate) fn combined_text(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&self.stderr).trim().to_string();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout,
            (true, false) => stderr,
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Runs short-lived external tools (npm, the dependency's `--version` probe).
pub(crate) trait CommandRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        env_overrides: &BTreeMap<String, OsString>,
    ) -> Result<CommandOutput, io::Error>;
}

pub(crate) struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        env_overrides: &BTreeMap<String, OsString>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        let output = cmd.output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

pub(crate) fn render_command(program: &Path, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(&program.to_string_lossy()));
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

pub(crate) fn spawn_error(err: &io::Error, command: &str) -> DeskError {
    let (error_code, hint) = if err.kind() == io::ErrorKind::NotFound {
        (
            "program_not_found".to_string(),
            Some("Check that the program exists and is executable.".to_string()),
        )
    } else if err.kind() == io::ErrorKind::PermissionDenied {
        (
            "program_not_executable".to_string(),
            Some("Check the file permissions of the program.".to_string()),
        )
    } else {
        ("process_command_failed".to_string(), None)
    };
    DeskError::ProcessDetailed {
        message: format!("failed to run command `{command}`: {err}"),
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(command.to_string()),
            raw_stderr: None,
        },
    }
}

/// `PATH` with `front` entries prepended, skipping duplicates.
pub(crate) fn prepend_search_path(front: &[PathBuf], current: Option<OsString>) -> OsString {
    let mut entries: Vec<PathBuf> = Vec::new();
    for dir in front {
        if !entries.iter().any(|existing| existing == dir) {
            entries.push(dir.clone());
        }
    }
    if let Some(current) = current {
        for dir in std::env::split_paths(&current) {
            if !entries.iter().any(|existing| existing == &dir) {
                entries.push(dir);
            }
        }
    }
    std::env::join_paths(entries.iter()).unwrap_or_else(|_| {
        // A directory containing the separator cannot be joined; keep the existing order
        // without the offending entries.
        let clean: Vec<&PathBuf> = entries
            .iter()
            .filter(|dir| std::env::join_paths([dir.as_path()]).is_ok())
            .collect();
        std::env::join_paths(clean).unwrap_or_default()
    })
}

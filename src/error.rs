use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum DeskError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
    #[error("package manager runtime is missing: {0}")]
    RuntimeMissing(String),
    #[error("install of {package} failed with status {status_code}: {output}")]
    InstallFailed {
        package: String,
        status_code: i32,
        output: String,
    },
    #[error("installed executable not found at {0}")]
    ExecutableNotFound(String),
    #[error("version check of {executable} failed: {output}")]
    VersionCheckFailed { executable: String, output: String },
    #[error("backend exited unexpectedly ({})", describe_exit(.code))]
    BackendExitedUnexpectedly { code: Option<i32> },
    #[error("backend did not accept connections on {address} within {waited_ms}ms")]
    ReadinessTimeout { address: String, waited_ms: u64 },
    #[error("update check failed: {0}")]
    UpdateCheckFailed(String),
    #[error("failed to open a terminal for authentication: {0}")]
    TerminalLaunchFailed(String),
    #[error("another launcher is already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct ProcessErrorDetails {
    pub(crate) error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) raw_stderr: Option<String>,
}

impl DeskError {
    /// Structured details for the `--json` error envelope.
    pub(crate) fn details(&self) -> Option<ProcessErrorDetails> {
        match self {
            DeskError::ProcessDetailed { details, .. } => Some(details.clone()),
            DeskError::RuntimeMissing(path) => Some(ProcessErrorDetails {
                error_code: "runtime_missing".to_string(),
                hint: Some(
                    "Reinstall the application, or install Node.js so that `npm` is on PATH."
                        .to_string(),
                ),
                command: None,
                raw_stderr: Some(path.clone()),
            }),
            DeskError::InstallFailed { output, .. } => {
                let (error_code, hint) = classify_install_failure(output);
                Some(ProcessErrorDetails {
                    error_code,
                    hint,
                    command: None,
                    raw_stderr: if output.is_empty() {
                        None
                    } else {
                        Some(output.clone())
                    },
                })
            }
            DeskError::ExecutableNotFound(_) => Some(ProcessErrorDetails {
                error_code: "executable_not_found".to_string(),
                hint: Some("Remove the dependency cache directory and relaunch.".to_string()),
                command: None,
                raw_stderr: None,
            }),
            DeskError::VersionCheckFailed { executable, output } => Some(ProcessErrorDetails {
                error_code: "version_check_failed".to_string(),
                hint: None,
                command: Some(format!("{executable} --version")),
                raw_stderr: if output.is_empty() {
                    None
                } else {
                    Some(output.clone())
                },
            }),
            _ => None,
        }
    }
}

pub(crate) fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "unknown exit status".to_string(),
    }
}

pub(crate) fn classify_install_failure(output: &str) -> (String, Option<String>) {
    let lower = output.to_lowercase();

    if lower.contains("enotfound")
        || lower.contains("etimedout")
        || lower.contains("econnreset")
        || lower.contains("econnrefused")
        || lower.contains("network")
    {
        return (
            "install_network_error".to_string(),
            Some("The package registry is unreachable. Check the network or proxy settings and relaunch.".to_string()),
        );
    }

    if lower.contains("eacces") || lower.contains("eperm") || lower.contains("permission denied")
    {
        return (
            "install_permission_denied".to_string(),
            Some("The dependency cache directory is not writable. Fix its ownership and relaunch.".to_string()),
        );
    }

    if lower.contains("enospc") || lower.contains("no space left") {
        return (
            "install_disk_full".to_string(),
            Some("Free some disk space and relaunch.".to_string()),
        );
    }

    if lower.contains("e404") || lower.contains("404 not found") {
        return (
            "install_package_not_found".to_string(),
            Some("Check dependency.package and dependency.version in the config.".to_string()),
        );
    }

    ("install_failed".to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_install_failure_detects_network_errors() {
        let (code, hint) = classify_install_failure("npm ERR! network error\n");
        assert_eq!(code, "install_network_error");
        assert!(hint.is_some());
        let (code, _) = classify_install_failure("npm ERR! code ENOTFOUND");
        assert_eq!(code, "install_network_error");
    }

    #[test]
    fn classify_install_failure_falls_back_to_generic_code() {
        let (code, hint) = classify_install_failure("something odd happened");
        assert_eq!(code, "install_failed");
        assert!(hint.is_none());
    }

    #[test]
    fn install_failed_details_carry_captured_output() {
        let err = DeskError::InstallFailed {
            package: "@google/gemini-cli@latest".to_string(),
            status_code: 1,
            output: "network error".to_string(),
        };
        let details = err.details().expect("details");
        assert_eq!(details.error_code, "install_network_error");
        assert_eq!(details.raw_stderr.as_deref(), Some("network error"));
        assert!(err.to_string().contains("status 1"));
    }

    #[test]
    fn backend_exit_message_includes_code() {
        let err = DeskError::BackendExitedUnexpectedly { code: Some(137) };
        assert_eq!(
            err.to_string(),
            "backend exited unexpectedly (exit code 137)"
        );
    }
}

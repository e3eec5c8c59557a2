use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::DeskError;
use crate::platform::{HostOs, Platform};

/// The long-lived UI surface, pointed at the backend once it is reachable.
pub(crate) trait MainWindow {
    fn show(&mut self, url: &str) -> Result<(), DeskError>;
}

/// Opens the UI in the system browser.
pub(crate) struct BrowserWindow {
    platform: Platform,
}

impl BrowserWindow {
    pub(crate) fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

pub(crate) fn browser_command(platform: &Platform, url: &str) -> (PathBuf, Vec<String>) {
    match platform.os {
        HostOs::MacOs => (PathBuf::from("open"), vec![url.to_string()]),
        HostOs::Windows => (
            PathBuf::from("cmd"),
            vec![
                "/C".to_string(),
                "start".to_string(),
                // Empty window title; std quotes an empty argument as "".
                String::new(),
                url.to_string(),
            ],
        ),
        HostOs::Linux => (PathBuf::from("xdg-open"), vec![url.to_string()]),
    }
}

impl MainWindow for BrowserWindow {
    fn show(&mut self, url: &str) -> Result<(), DeskError> {
        let (program, args) = browser_command(&self.platform, url);
        let status = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|err| {
                DeskError::Process(format!("failed to run {}: {err}", program.display()))
            })?;
        if !status.success() {
            return Err(DeskError::Process(format!(
                "{} exited with {status} while opening {url}",
                program.display()
            )));
        }
        log::info!("opened {url}");
        Ok(())
    }
}

/// Used with `--no-browser`: prints where the UI lives.
pub(crate) struct HeadlessWindow;

impl MainWindow for HeadlessWindow {
    fn show(&mut self, url: &str) -> Result<(), DeskError> {
        println!("GeminiDesk is ready at {url}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_commands_per_platform() {
        let url = "http://127.0.0.1:8001/index.html";
        let (program, args) =
            browser_command(&Platform::from_consts("macos", "aarch64").unwrap(), url);
        assert_eq!(program, PathBuf::from("open"));
        assert_eq!(args, vec![url.to_string()]);

        let (program, args) =
            browser_command(&Platform::from_consts("linux", "x86_64").unwrap(), url);
        assert_eq!(program, PathBuf::from("xdg-open"));
        assert_eq!(args, vec![url.to_string()]);

        let (program, args) =
            browser_command(&Platform::from_consts("windows", "x86_64").unwrap(), url);
        assert_eq!(program, PathBuf::from("cmd"));
        assert_eq!(args, vec!["/C", "start", "", url]);
    }
}

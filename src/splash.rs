use dialoguer::console::{style, Term};

/// One-way progress channel to the transient startup surface.
///
/// Each message replaces the previous one; nothing is kept.
pub(crate) trait StatusSink {
    fn show(&mut self);
    fn update(&mut self, message: &str);
    fn fail(&mut self, message: &str);
    fn close(&mut self);
}

/// Startup status line on stderr.
pub(crate) struct TerminalSplash {
    term: Term,
    visible: bool,
    line_open: bool,
}

impl TerminalSplash {
    pub(crate) fn new() -> Self {
        Self {
            term: Term::stderr(),
            visible: false,
            line_open: false,
        }
    }

    fn replace_line(&mut self, text: &str) {
        if self.term.is_term() {
            if self.line_open {
                let _ = self.term.clear_line();
            }
            let _ = self.term.write_str(text);
            self.line_open = true;
        } else {
            let _ = self.term.write_line(text);
        }
    }

    fn finish_line(&mut self) {
        if self.line_open {
            let _ = self.term.write_line("");
            self.line_open = false;
        }
    }
}

impl StatusSink for TerminalSplash {
    fn show(&mut self) {
        if self.visible {
            return;
        }
        self.visible = true;
        let _ = self
            .term
            .write_line(&format!("{}", style("GeminiDesk").bold().cyan()));
    }

    fn update(&mut self, message: &str) {
        log::info!("{message}");
        if !self.visible {
            return;
        }
        let text = format!("{} {}", style("•").cyan(), message);
        self.replace_line(&text);
    }

    fn fail(&mut self, message: &str) {
        log::error!("{message}");
        if !self.visible {
            return;
        }
        let text = format!("{} {}", style("✗").red().bold(), style(message).red());
        self.replace_line(&text);
        self.finish_line();
    }

    fn close(&mut self) {
        if !self.visible {
            return;
        }
        if self.term.is_term() && self.line_open {
            let _ = self.term.clear_line();
            self.line_open = false;
        } else {
            self.finish_line();
        }
        self.visible = false;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::StatusSink;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum SplashCall {
        Show,
        Update(String),
        Fail(String),
        Close,
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingSplash {
        pub(crate) calls: Arc<Mutex<Vec<SplashCall>>>,
    }

    impl RecordingSplash {
        pub(crate) fn calls(&self) -> Vec<SplashCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StatusSink for RecordingSplash {
        fn show(&mut self) {
            self.calls.lock().unwrap().push(SplashCall::Show);
        }

        fn update(&mut self, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(SplashCall::Update(message.to_string()));
        }

        fn fail(&mut self, message: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(SplashCall::Fail(message.to_string()));
        }

        fn close(&mut self) {
            self.calls.lock().unwrap().push(SplashCall::Close);
        }
    }
}

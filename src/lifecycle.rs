use std::fmt;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::backend::{BackendProcess, BackendSpawner};
use crate::config::{Config, ResolvedPaths};
use crate::error::DeskError;
use crate::installer::DependencyProvider;
use crate::instance::PidFile;
use crate::journal::EventJournal;
use crate::readiness::{Connector, ProbeHandle, ProbeResult, ReadinessProbe};
use crate::splash::StatusSink;
use crate::ui::MainWindow;
use crate::update::{check_and_log, UpdateChecker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LifecyclePhase {
    Idle,
    Installing,
    Spawning,
    AwaitingReady,
    Running,
    ShuttingDown,
    Terminated,
}

impl LifecyclePhase {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Idle => "idle",
            LifecyclePhase::Installing => "installing",
            LifecyclePhase::Spawning => "spawning",
            LifecyclePhase::AwaitingReady => "awaiting_ready",
            LifecyclePhase::Running => "running",
            LifecyclePhase::ShuttingDown => "shutting_down",
            LifecyclePhase::Terminated => "terminated",
        }
    }

    pub(crate) fn can_transition_to(&self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        matches!(
            (self, next),
            (Idle, Installing)
                | (Installing, Spawning)
                | (Spawning, AwaitingReady)
                | (AwaitingReady, Running)
                | (Idle | Installing | Spawning | AwaitingReady | Running, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShutdownTrigger {
    UserQuit,
    Signal(i32),
    BackendExited(Option<i32>),
    StartupFailed(String),
}

impl ShutdownTrigger {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            ShutdownTrigger::UserQuit | ShutdownTrigger::Signal(_) => 0,
            ShutdownTrigger::BackendExited(_) | ShutdownTrigger::StartupFailed(_) => 1,
        }
    }
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::UserQuit => write!(f, "user quit"),
            ShutdownTrigger::Signal(signal) => write!(f, "signal {signal}"),
            ShutdownTrigger::BackendExited(code) => write!(
                f,
                "backend exited ({})",
                crate::error::describe_exit(code)
            ),
            ShutdownTrigger::StartupFailed(reason) => write!(f, "startup failed: {reason}"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    Ready(ProbeResult),
    Quit,
    Signal(i32),
}

/// Clonable way for other threads to ask the coordinator to stop.
#[derive(Clone)]
pub(crate) struct QuitHandle {
    tx: Sender<LifecycleEvent>,
}

impl QuitHandle {
    pub(crate) fn quit(&self) {
        let _ = self.tx.send(LifecycleEvent::Quit);
    }

    pub(crate) fn signal(&self, signal: i32) {
        let _ = self.tx.send(LifecycleEvent::Signal(signal));
    }
}

/// Forwards SIGINT, SIGTERM and SIGHUP to the coordinator. Repeated signals while
/// shutting down are ignored; the backend is always stopped before the process exits.
pub(crate) fn spawn_signal_listener(handle: QuitHandle) -> Result<(), DeskError> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;

    #[cfg(unix)]
    let signals = [SIGINT, SIGTERM, signal_hook::consts::signal::SIGHUP];
    #[cfg(not(unix))]
    let signals = [SIGINT, SIGTERM];

    let mut flags = Vec::new();
    for signal in signals {
        let raised = Arc::new(AtomicBool::new(false));
        flag::register(signal, Arc::clone(&raised))?;
        flags.push((signal, raised));
    }

    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || loop {
            for (signal, raised) in &flags {
                if raised.swap(false, Ordering::AcqRel) {
                    log::info!("received signal {signal}");
                    handle.signal(*signal);
                }
            }
            thread::sleep(Duration::from_millis(50));
        })?;
    Ok(())
}

/// Typing `q` or `quit` on an interactive stdin quits the application.
pub(crate) fn spawn_stdin_listener(handle: QuitHandle) {
    if !std::io::stdin().is_terminal() {
        return;
    }
    let spawned = thread::Builder::new()
        .name("stdin-listener".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) if matches!(line.trim(), "q" | "quit") => {
                        handle.quit();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        log::warn!("failed to start stdin listener: {err}");
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CoordinatorSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) ui_url: String,
    pub(crate) poll_interval: Duration,
    pub(crate) ready_timeout: Option<Duration>,
    pub(crate) grace_period: Duration,
    pub(crate) fatal_error_delay: Duration,
    pub(crate) backend_pid_path: Option<PathBuf>,
}

impl CoordinatorSettings {
    pub(crate) fn from_config(cfg: &Config, paths: &ResolvedPaths) -> Self {
        Self {
            host: cfg.backend.host.clone(),
            port: cfg.backend.port,
            ui_url: cfg.ui_url(),
            poll_interval: cfg.lifecycle.poll_interval(),
            ready_timeout: cfg.lifecycle.ready_timeout(),
            grace_period: cfg.lifecycle.grace_period(),
            fatal_error_delay: cfg.lifecycle.fatal_error_delay(),
            backend_pid_path: Some(paths.backend_pid_path()),
        }
    }
}

/// The collaborators a coordinator drives, all behind seams.
pub(crate) struct Collaborators {
    pub(crate) installer: Box<dyn DependencyProvider>,
    pub(crate) spawner: Box<dyn BackendSpawner>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) splash: Box<dyn StatusSink>,
    pub(crate) window: Box<dyn MainWindow>,
    pub(crate) updates: Option<Arc<dyn UpdateChecker>>,
}

#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub(crate) trigger: ShutdownTrigger,
    pub(crate) phases: Vec<LifecyclePhase>,
    pub(crate) forced_kills: u32,
    pub(crate) error: Option<DeskError>,
}

impl RunOutcome {
    pub(crate) fn exit_code(&self) -> i32 {
        self.trigger.exit_code()
    }
}

/// Owns the application lifecycle from install to teardown.
///
/// Everything mutable lives here and is touched from one thread only. Helper threads
/// (readiness prober, signal and stdin listeners) talk to it through the event channel.
pub(crate) struct Coordinator {
    settings: CoordinatorSettings,
    parts: Collaborators,
    journal: EventJournal,
    phase: LifecyclePhase,
    history: Vec<LifecyclePhase>,
    backend: Option<Box<dyn BackendProcess>>,
    backend_pid: Option<PidFile>,
    probe: Option<ProbeHandle>,
    trigger: Option<ShutdownTrigger>,
    error: Option<DeskError>,
    forced_kills: u32,
    events_tx: Sender<LifecycleEvent>,
    events_rx: Receiver<LifecycleEvent>,
}

impl Coordinator {
    pub(crate) fn new(
        settings: CoordinatorSettings,
        parts: Collaborators,
        journal: EventJournal,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            settings,
            parts,
            journal,
            phase: LifecyclePhase::Idle,
            history: vec![LifecyclePhase::Idle],
            backend: None,
            backend_pid: None,
            probe: None,
            trigger: None,
            error: None,
            forced_kills: 0,
            events_tx,
            events_rx,
        }
    }

    pub(crate) fn quit_handle(&self) -> QuitHandle {
        QuitHandle {
            tx: self.events_tx.clone(),
        }
    }

    pub(crate) fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub(crate) fn run(&mut self) -> Result<RunOutcome, DeskError> {
        self.start()?;
        while self.trigger.is_none() {
            self.tick()?;
        }
        self.shutdown()?;
        Ok(RunOutcome {
            trigger: self
                .trigger
                .clone()
                .unwrap_or(ShutdownTrigger::UserQuit),
            phases: self.history.clone(),
            forced_kills: self.forced_kills,
            error: self.error.take(),
        })
    }

    fn transition(&mut self, next: LifecyclePhase) -> Result<(), DeskError> {
        if !self.phase.can_transition_to(next) {
            return Err(DeskError::Lifecycle(format!(
                "illegal transition {} -> {}",
                self.phase.as_str(),
                next.as_str()
            )));
        }
        log::info!("lifecycle: {} -> {}", self.phase.as_str(), next.as_str());
        self.journal.emit(
            "phase",
            "info",
            json!({"from": self.phase, "to": next}),
        );
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeskError> {
        self.parts.splash.show();
        self.transition(LifecyclePhase::Installing)?;
        let dependency = match self.parts.installer.ensure(self.parts.splash.as_mut()) {
            Ok(path) => path,
            Err(err) => return self.fail_startup(err),
        };
        if self.take_pending_stop()? {
            return Ok(());
        }

        self.transition(LifecyclePhase::Spawning)?;
        self.parts.splash.update("Starting backend…");
        match self.parts.spawner.spawn(&dependency) {
            Ok(backend) => {
                let pid = backend.id();
                self.journal
                    .emit("backend_spawned", "info", json!({"pid": pid}));
                if let Some(path) = &self.settings.backend_pid_path {
                    match PidFile::create(path.clone(), pid) {
                        Ok(file) => self.backend_pid = Some(file),
                        Err(err) => log::warn!("failed to record backend pid: {err}"),
                    }
                }
                self.backend = Some(backend);
            }
            Err(err) => return self.fail_startup(err),
        }

        self.transition(LifecyclePhase::AwaitingReady)?;
        self.parts.splash.update(&format!(
            "Waiting for backend on {}:{}…",
            self.settings.host, self.settings.port
        ));
        let tx = self.events_tx.clone();
        let probe = ReadinessProbe::new(self.settings.host.clone(), self.settings.port)
            .with_interval(self.settings.poll_interval)
            .with_timeout(self.settings.ready_timeout);
        self.probe = Some(probe.spawn(Arc::clone(&self.parts.connector), move |result| {
            let _ = tx.send(LifecycleEvent::Ready(result));
        }));
        Ok(())
    }

    /// Applies a quit or signal that arrived while startup was blocked.
    fn take_pending_stop(&mut self) -> Result<bool, DeskError> {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                LifecycleEvent::Quit => {
                    self.request_shutdown(ShutdownTrigger::UserQuit)?;
                }
                LifecycleEvent::Signal(signal) => {
                    self.request_shutdown(ShutdownTrigger::Signal(signal))?;
                }
                LifecycleEvent::Ready(_) => {}
            }
        }
        Ok(self.trigger.is_some())
    }

    fn tick(&mut self) -> Result<(), DeskError> {
        match self.events_rx.recv_timeout(self.settings.poll_interval) {
            Ok(event) => self.handle_event(event)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                self.request_shutdown(ShutdownTrigger::UserQuit)?;
            }
        }
        if self.trigger.is_none() {
            self.poll_backend()?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: LifecycleEvent) -> Result<(), DeskError> {
        match event {
            LifecycleEvent::Ready(result) => {
                if self.phase != LifecyclePhase::AwaitingReady {
                    log::debug!("ignoring readiness result in phase {}", self.phase.as_str());
                    return Ok(());
                }
                self.probe = None;
                match result {
                    Ok(attempts) => self.enter_running(attempts),
                    Err(err) => self.fail_startup(err),
                }
            }
            LifecycleEvent::Quit => self.request_shutdown(ShutdownTrigger::UserQuit).map(|_| ()),
            LifecycleEvent::Signal(signal) => self
                .request_shutdown(ShutdownTrigger::Signal(signal))
                .map(|_| ()),
        }
    }

    fn enter_running(&mut self, attempts: u64) -> Result<(), DeskError> {
        log::info!(
            "backend ready after {attempts} attempt(s); opening {}",
            self.settings.ui_url
        );
        if let Err(err) = self.parts.window.show(&self.settings.ui_url) {
            log::warn!("failed to open the main window: {err}");
            println!("Open {} in a browser", self.settings.ui_url);
        }
        self.parts.splash.close();
        self.transition(LifecyclePhase::Running)?;

        if let Some(checker) = self.parts.updates.clone() {
            let spawned = thread::Builder::new()
                .name("update-check".to_string())
                .spawn(move || check_and_log(checker.as_ref()));
            if let Err(err) = spawned {
                log::warn!("failed to start update check: {err}");
            }
        }
        Ok(())
    }

    fn poll_backend(&mut self) -> Result<(), DeskError> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        let code = match backend.try_wait() {
            Ok(Some(code)) => code,
            Ok(None) => return Ok(()),
            Err(err) => {
                log::warn!("failed to poll backend: {err}");
                return Ok(());
            }
        };
        self.backend = None;
        self.backend_pid = None;
        self.journal
            .emit("backend_exited", "error", json!({"code": code}));
        let err = DeskError::BackendExitedUnexpectedly { code: Some(code) };
        if self.phase == LifecyclePhase::Running {
            log::error!("{err}");
            if self.request_shutdown(ShutdownTrigger::BackendExited(Some(code)))? {
                self.error = Some(err);
            }
            Ok(())
        } else {
            self.fail_startup(err)
        }
    }

    fn fail_startup(&mut self, err: DeskError) -> Result<(), DeskError> {
        let message = err.to_string();
        self.parts.splash.fail(&message);
        self.journal
            .emit("startup_failed", "error", json!({"error": message, "phase": self.phase}));
        thread::sleep(self.settings.fatal_error_delay);
        self.parts.splash.close();
        if self.request_shutdown(ShutdownTrigger::StartupFailed(message))? {
            self.error = Some(err);
        }
        Ok(())
    }

    /// Moves to `ShuttingDown` on the first trigger. Later triggers are ignored and
    /// `false` is returned.
    pub(crate) fn request_shutdown(&mut self, trigger: ShutdownTrigger) -> Result<bool, DeskError> {
        if self.trigger.is_some()
            || matches!(
                self.phase,
                LifecyclePhase::ShuttingDown | LifecyclePhase::Terminated
            )
        {
            log::info!("shutdown already in progress; ignoring {trigger}");
            return Ok(false);
        }
        log::info!("shutting down: {trigger}");
        self.journal.emit(
            "shutdown_requested",
            "info",
            json!({"trigger": trigger.to_string()}),
        );
        self.transition(LifecyclePhase::ShuttingDown)?;
        self.trigger = Some(trigger);
        Ok(true)
    }

    fn shutdown(&mut self) -> Result<(), DeskError> {
        if let Some(mut probe) = self.probe.take() {
            probe.cancel();
        }
        if let Some(mut backend) = self.backend.take() {
            self.stop_backend(backend.as_mut());
        }
        self.backend_pid = None;
        self.transition(LifecyclePhase::Terminated)
    }

    fn stop_backend(&mut self, backend: &mut dyn BackendProcess) {
        let pid = backend.id();
        if let Err(err) = backend.terminate() {
            log::warn!("failed to request backend shutdown: {err}");
        }
        let deadline = Instant::now() + self.settings.grace_period;
        let step = self.settings.poll_interval.min(Duration::from_millis(50));
        let mut exited = None;
        loop {
            match backend.try_wait() {
                Ok(Some(code)) => {
                    exited = Some(code);
                    break;
                }
                Ok(None) => {}
                Err(err) => log::warn!("failed to poll backend: {err}"),
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(step.min(deadline - now));
        }

        if exited.is_none() {
            log::warn!(
                "backend (pid {pid}) still running after {}ms; killing it",
                self.settings.grace_period.as_millis()
            );
            self.forced_kills += 1;
            self.journal
                .emit("backend_force_killed", "warn", json!({"pid": pid}));
            if let Err(err) = backend.kill() {
                log::warn!("failed to kill backend: {err}");
            }
        }
        match backend.wait() {
            Ok(code) => log::info!("backend (pid {pid}) stopped with code {code}"),
            Err(err) => log::warn!("failed to reap backend: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DependencyConfig, LaunchMode};
    use crate::installer::testing::{MockRunner, MockTerminal};
    use crate::installer::{bundled_npm_path, DependencyInstaller};
    use crate::platform::Platform;
    use crate::splash::testing::{RecordingSplash, SplashCall};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Default)]
    struct BackendState {
        spawned: u32,
        exit: Option<i32>,
        ignore_terminate: bool,
        terminates: u32,
        kills: u32,
        waits: u32,
    }

    struct MockBackend {
        state: Arc<Mutex<BackendState>>,
    }

    impl BackendProcess for MockBackend {
        fn id(&self) -> u32 {
            4242
        }

        fn try_wait(&mut self) -> Result<Option<i32>, DeskError> {
            Ok(self.state.lock().unwrap().exit)
        }

        fn terminate(&mut self) -> Result<(), DeskError> {
            let mut state = self.state.lock().unwrap();
            state.terminates += 1;
            if !state.ignore_terminate && state.exit.is_none() {
                state.exit = Some(143);
            }
            Ok(())
        }

        fn kill(&mut self) -> Result<(), DeskError> {
            let mut state = self.state.lock().unwrap();
            state.kills += 1;
            if state.exit.is_none() {
                state.exit = Some(137);
            }
            Ok(())
        }

        fn wait(&mut self) -> Result<i32, DeskError> {
            let mut state = self.state.lock().unwrap();
            state.waits += 1;
            Ok(state.exit.unwrap_or(-1))
        }
    }

    struct MockSpawner {
        state: Arc<Mutex<BackendState>>,
    }

    impl BackendSpawner for MockSpawner {
        fn spawn(&self, _dependency: &Path) -> Result<Box<dyn BackendProcess>, DeskError> {
            self.state.lock().unwrap().spawned += 1;
            Ok(Box::new(MockBackend {
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct ScriptedConnector {
        failures_before_success: u64,
        attempts: Arc<AtomicU64>,
    }

    impl Connector for ScriptedConnector {
        fn attempt(&self, _host: &str, _port: u16) -> bool {
            let seen = self.attempts.fetch_add(1, Ordering::SeqCst);
            seen >= self.failures_before_success
        }
    }

    type ShowHook = Box<dyn FnMut(&str)>;

    struct MockWindow {
        shown: Arc<Mutex<Vec<String>>>,
        on_show: Option<ShowHook>,
    }

    impl MainWindow for MockWindow {
        fn show(&mut self, url: &str) -> Result<(), DeskError> {
            self.shown.lock().unwrap().push(url.to_string());
            if let Some(hook) = self.on_show.as_mut() {
                hook(url);
            }
            Ok(())
        }
    }

    struct StaticInstaller {
        path: PathBuf,
    }

    impl DependencyProvider for StaticInstaller {
        fn ensure(&self, _status: &mut dyn StatusSink) -> Result<PathBuf, DeskError> {
            Ok(self.path.clone())
        }
    }

    struct Harness {
        backend: Arc<Mutex<BackendState>>,
        attempts: Arc<AtomicU64>,
        shown: Arc<Mutex<Vec<String>>>,
        splash: RecordingSplash,
    }

    fn settings() -> CoordinatorSettings {
        CoordinatorSettings {
            host: "127.0.0.1".to_string(),
            port: 8001,
            ui_url: "http://127.0.0.1:8001/index.html".to_string(),
            poll_interval: Duration::from_millis(5),
            ready_timeout: None,
            grace_period: Duration::from_millis(60),
            fatal_error_delay: Duration::from_millis(30),
            backend_pid_path: None,
        }
    }

    fn coordinator(
        installer: Box<dyn DependencyProvider>,
        failures_before_ready: u64,
        on_show: Option<ShowHook>,
    ) -> (Coordinator, Harness) {
        let harness = Harness {
            backend: Arc::new(Mutex::new(BackendState::default())),
            attempts: Arc::new(AtomicU64::new(0)),
            shown: Arc::new(Mutex::new(Vec::new())),
            splash: RecordingSplash::default(),
        };
        let parts = Collaborators {
            installer,
            spawner: Box::new(MockSpawner {
                state: Arc::clone(&harness.backend),
            }),
            connector: Arc::new(ScriptedConnector {
                failures_before_success: failures_before_ready,
                attempts: Arc::clone(&harness.attempts),
            }),
            splash: Box::new(harness.splash.clone()),
            window: Box::new(MockWindow {
                shown: Arc::clone(&harness.shown),
                on_show,
            }),
            updates: None,
        };
        (
            Coordinator::new(settings(), parts, EventJournal::disabled()),
            harness,
        )
    }

    fn static_installer() -> Box<dyn DependencyProvider> {
        Box::new(StaticInstaller {
            path: PathBuf::from("/cache/bin/gemini"),
        })
    }

    fn quit_on_show(handle: QuitHandle) -> Option<ShowHook> {
        Some(Box::new(move |_| handle.quit()))
    }

    use LifecyclePhase::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        assert!(Idle.can_transition_to(Installing));
        assert!(AwaitingReady.can_transition_to(Running));
        assert!(Running.can_transition_to(ShuttingDown));
        assert!(Idle.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Terminated));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Spawning.can_transition_to(Running));
        assert!(!Terminated.can_transition_to(ShuttingDown));
        assert!(!Running.can_transition_to(Terminated));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let (mut coordinator, _harness) = coordinator(static_installer(), 0, None);
        let err = coordinator.transition(Running).unwrap_err();
        assert!(matches!(err, DeskError::Lifecycle(_)));
        assert_eq!(coordinator.phase(), Idle);
    }

    #[test]
    fn trigger_exit_codes() {
        assert_eq!(ShutdownTrigger::UserQuit.exit_code(), 0);
        assert_eq!(ShutdownTrigger::Signal(15).exit_code(), 0);
        assert_eq!(ShutdownTrigger::BackendExited(Some(137)).exit_code(), 1);
        assert_eq!(ShutdownTrigger::StartupFailed("x".into()).exit_code(), 1);
    }

    #[test]
    fn running_is_only_entered_after_the_prober_signals() {
        let (tx, rx) = mpsc::channel();
        let (mut coordinator, harness) = coordinator(static_installer(), 3, None);
        let attempts = Arc::clone(&harness.attempts);
        let quit = coordinator.quit_handle();
        coordinator.parts.window = Box::new(MockWindow {
            shown: Arc::clone(&harness.shown),
            on_show: Some(Box::new(move |_| {
                tx.send(attempts.load(Ordering::SeqCst)).unwrap();
                quit.quit();
            })),
        });

        let outcome = coordinator.run().unwrap();
        let attempts_at_show = rx.try_recv().unwrap();
        assert_eq!(attempts_at_show, 4);
        assert_eq!(
            outcome.phases,
            vec![
                Idle,
                Installing,
                Spawning,
                AwaitingReady,
                Running,
                ShuttingDown,
                Terminated
            ]
        );
    }

    #[test]
    fn user_quit_runs_graceful_shutdown_and_exits_zero() {
        let (mut coordinator, harness) = coordinator(static_installer(), 0, None);
        coordinator.parts.window = Box::new(MockWindow {
            shown: Arc::clone(&harness.shown),
            on_show: quit_on_show(coordinator.quit_handle()),
        });

        let outcome = coordinator.run().unwrap();
        assert_eq!(outcome.trigger, ShutdownTrigger::UserQuit);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.forced_kills, 0);
        assert!(outcome.error.is_none());
        let backend = harness.backend.lock().unwrap();
        assert_eq!(backend.terminates, 1);
        assert_eq!(backend.kills, 0);
        assert_eq!(backend.waits, 1);
        assert!(coordinator.backend.is_none());
    }

    #[test]
    fn unresponsive_backend_is_killed_exactly_once() {
        let (mut coordinator, harness) = coordinator(static_installer(), 0, None);
        harness.backend.lock().unwrap().ignore_terminate = true;
        coordinator.parts.window = Box::new(MockWindow {
            shown: Arc::clone(&harness.shown),
            on_show: quit_on_show(coordinator.quit_handle()),
        });

        let started = Instant::now();
        let outcome = coordinator.run().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(outcome.forced_kills, 1);
        let backend = harness.backend.lock().unwrap();
        assert_eq!(backend.terminates, 1);
        assert_eq!(backend.kills, 1);
        assert_eq!(coordinator.phase(), Terminated);
    }

    #[test]
    fn repeated_triggers_enter_shutting_down_once() {
        let (mut coordinator, _harness) = coordinator(static_installer(), 0, None);
        assert!(coordinator
            .request_shutdown(ShutdownTrigger::BackendExited(Some(137)))
            .unwrap());
        assert!(!coordinator
            .request_shutdown(ShutdownTrigger::BackendExited(Some(137)))
            .unwrap());
        assert!(!coordinator.request_shutdown(ShutdownTrigger::UserQuit).unwrap());
        let entered = coordinator
            .history
            .iter()
            .filter(|phase| **phase == ShuttingDown)
            .count();
        assert_eq!(entered, 1);
        assert_eq!(
            coordinator.trigger,
            Some(ShutdownTrigger::BackendExited(Some(137)))
        );
    }

    #[test]
    fn signal_event_shuts_down_with_zero_exit() {
        let (mut coordinator, harness) = coordinator(static_installer(), 0, None);
        let handle = coordinator.quit_handle();
        coordinator.parts.window = Box::new(MockWindow {
            shown: Arc::clone(&harness.shown),
            on_show: Some(Box::new(move |_| handle.signal(15))),
        });
        let outcome = coordinator.run().unwrap();
        assert_eq!(outcome.trigger, ShutdownTrigger::Signal(15));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn backend_exit_while_running_terminates_with_failure() {
        let (mut coordinator, harness) = coordinator(static_installer(), 0, None);
        let backend = Arc::clone(&harness.backend);
        coordinator.parts.window = Box::new(MockWindow {
            shown: Arc::clone(&harness.shown),
            on_show: Some(Box::new(move |_| {
                backend.lock().unwrap().exit = Some(137);
            })),
        });

        let outcome = coordinator.run().unwrap();
        assert_eq!(outcome.trigger, ShutdownTrigger::BackendExited(Some(137)));
        assert_eq!(outcome.exit_code(), 1);
        assert!(matches!(
            outcome.error,
            Some(DeskError::BackendExitedUnexpectedly { code: Some(137) })
        ));
        assert_eq!(
            &outcome.phases[outcome.phases.len() - 3..],
            &[Running, ShuttingDown, Terminated]
        );
        let backend = harness.backend.lock().unwrap();
        assert_eq!(backend.terminates, 0);
        assert_eq!(backend.kills, 0);
    }

    struct SignalledInstaller {
        handle: QuitHandle,
    }

    impl DependencyProvider for SignalledInstaller {
        fn ensure(&self, _status: &mut dyn StatusSink) -> Result<PathBuf, DeskError> {
            self.handle.signal(15);
            Ok(PathBuf::from("/cache/bin/gemini"))
        }
    }

    #[test]
    fn signal_during_install_skips_spawning() {
        let (mut coordinator, harness) = coordinator(static_installer(), 0, None);
        coordinator.parts.installer = Box::new(SignalledInstaller {
            handle: coordinator.quit_handle(),
        });

        let outcome = coordinator.run().unwrap();
        assert_eq!(outcome.trigger, ShutdownTrigger::Signal(15));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            outcome.phases,
            vec![Idle, Installing, ShuttingDown, Terminated]
        );
        assert_eq!(harness.backend.lock().unwrap().spawned, 0);
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 0);
        assert!(harness.shown.lock().unwrap().is_empty());
    }

    #[test]
    fn backend_exit_before_ready_is_a_startup_failure() {
        let (mut coordinator, harness) = coordinator(static_installer(), u64::MAX, None);
        harness.backend.lock().unwrap().exit = Some(1);
        let outcome = coordinator.run().unwrap();
        assert!(matches!(outcome.trigger, ShutdownTrigger::StartupFailed(_)));
        assert!(harness.shown.lock().unwrap().is_empty());
        assert!(!outcome.phases.contains(&Running));
        assert!(harness
            .splash
            .calls()
            .iter()
            .any(|call| matches!(call, SplashCall::Fail(message) if message.contains("exit code 1"))));
    }

    #[test]
    fn readiness_timeout_is_fatal() {
        let (mut coordinator, harness) = coordinator(static_installer(), u64::MAX, None);
        coordinator.settings.ready_timeout = Some(Duration::from_millis(30));
        let outcome = coordinator.run().unwrap();
        assert!(matches!(
            outcome.error,
            Some(DeskError::ReadinessTimeout { .. })
        ));
        assert_eq!(harness.backend.lock().unwrap().terminates, 1);
        assert_eq!(outcome.exit_code(), 1);
    }

    struct PackagedFixture {
        _dir: TempDir,
        cache_root: PathBuf,
        resources_dir: PathBuf,
        marker: PathBuf,
    }

    fn packaged_fixture() -> PackagedFixture {
        let dir = tempdir().unwrap();
        let resources_dir = dir.path().join("resources");
        let npm = bundled_npm_path(&resources_dir, &linux());
        fs::create_dir_all(npm.parent().unwrap()).unwrap();
        fs::write(&npm, "").unwrap();
        let marker = dir.path().join("home/.gemini/oauth_creds.json");
        fs::create_dir_all(marker.parent().unwrap()).unwrap();
        fs::write(&marker, "{}").unwrap();
        PackagedFixture {
            cache_root: dir.path().join("cache"),
            resources_dir,
            marker,
            _dir: dir,
        }
    }

    fn linux() -> Platform {
        Platform::from_consts("linux", "x86_64").unwrap()
    }

    fn packaged_installer(fx: &PackagedFixture, runner: MockRunner) -> Box<dyn DependencyProvider> {
        Box::new(DependencyInstaller::new(
            DependencyConfig::default(),
            &fx.cache_root,
            fx.marker.clone(),
            LaunchMode::Packaged,
            fx.resources_dir.clone(),
            linux(),
            runner,
            MockTerminal::default(),
        ))
    }

    #[test]
    fn fresh_packaged_launch_reaches_running() {
        let fx = packaged_fixture();
        let runner = MockRunner {
            create_on_install: Some(fx.cache_root.join("bin").join("gemini")),
            ..MockRunner::default()
        };
        runner.push_output(0, "added 1 package", "");
        runner.push_output(0, "0.9.0", "");
        let (mut coordinator, harness) = coordinator(packaged_installer(&fx, runner), 3, None);
        coordinator.parts.window = Box::new(MockWindow {
            shown: Arc::clone(&harness.shown),
            on_show: quit_on_show(coordinator.quit_handle()),
        });

        let outcome = coordinator.run().unwrap();
        assert!(outcome.phases.contains(&Running));
        assert_eq!(
            *harness.shown.lock().unwrap(),
            vec!["http://127.0.0.1:8001/index.html".to_string()]
        );
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(harness.backend.lock().unwrap().spawned, 1);

        let calls = harness.splash.calls();
        assert_eq!(calls.first(), Some(&SplashCall::Show));
        let close_at = calls
            .iter()
            .position(|call| *call == SplashCall::Close)
            .unwrap();
        assert!(calls[..close_at]
            .iter()
            .any(|call| matches!(call, SplashCall::Update(message) if message.starts_with("Installing"))));
        assert!(!calls.iter().any(|call| matches!(call, SplashCall::Fail(_))));
    }

    #[test]
    fn failed_install_shuts_down_after_fatal_delay_without_spawning() {
        let fx = packaged_fixture();
        let runner = MockRunner::default();
        runner.push_output(1, "", "network error");
        let (mut coordinator, harness) = coordinator(packaged_installer(&fx, runner), 0, None);

        let started = Instant::now();
        let outcome = coordinator.run().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(
            outcome.phases,
            vec![Idle, Installing, ShuttingDown, Terminated]
        );
        assert_eq!(outcome.exit_code(), 1);
        assert!(matches!(
            outcome.error,
            Some(DeskError::InstallFailed { status_code: 1, .. })
        ));
        assert_eq!(harness.backend.lock().unwrap().spawned, 0);
        assert!(harness.shown.lock().unwrap().is_empty());
        let calls = harness.splash.calls();
        let fail_at = calls
            .iter()
            .position(|call| matches!(call, SplashCall::Fail(message) if message.contains("network error")))
            .unwrap();
        assert_eq!(calls.last(), Some(&SplashCall::Close));
        assert!(fail_at < calls.len() - 1);
    }

    #[test]
    fn backend_pid_file_lives_while_backend_runs() {
        let dir = tempdir().unwrap();
        let pid_path = dir.path().join("backend.pid");
        let (mut coordinator, harness) = coordinator(static_installer(), 0, None);
        coordinator.settings.backend_pid_path = Some(pid_path.clone());
        let quit = coordinator.quit_handle();
        let observed = Arc::new(Mutex::new(None));
        let observed_in_hook = Arc::clone(&observed);
        let path_in_hook = pid_path.clone();
        coordinator.parts.window = Box::new(MockWindow {
            shown: Arc::clone(&harness.shown),
            on_show: Some(Box::new(move |_| {
                *observed_in_hook.lock().unwrap() =
                    crate::instance::read_pid_file(&path_in_hook);
                quit.quit();
            })),
        });

        coordinator.run().unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(4242));
        assert!(!pid_path.exists());
    }
}

mod backend;
mod config;
mod error;
mod installer;
mod instance;
mod journal;
mod lifecycle;
mod platform;
mod readiness;
mod runner;
mod splash;
mod ui;
mod update;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{backend_executable, SystemSpawner};
use crate::config::{
    ensure_parent, load_config, read_config, resolve_config_path, resolve_paths,
    resolve_resources_dir, Config, LaunchMode, DEFAULT_CONFIG_YAML,
};
use crate::error::{DeskError, ProcessErrorDetails};
use crate::installer::{
    bundled_npm_path, locate_runtime, DependencyInstaller, DependencyProvider, InstallLayout,
    SystemTerminal,
};
use crate::instance::{process_is_alive, read_pid_file, request_shutdown, wait_for_exit, InstanceLock};
use crate::journal::EventJournal;
use crate::lifecycle::{
    spawn_signal_listener, spawn_stdin_listener, Collaborators, Coordinator, CoordinatorSettings,
};
use crate::platform::Platform;
use crate::readiness::{Connector, ReadinessProbe, TcpConnector};
use crate::runner::SystemCommandRunner;
use crate::splash::TerminalSplash;
use crate::ui::{BrowserWindow, HeadlessWindow, MainWindow};
use crate::update::{GitHubReleaseChecker, UpdateChecker};

#[derive(Parser, Debug)]
#[command(name = "geminidesk", version, about = "GeminiDesk launcher")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true, hide = true)]
    resources_dir: Option<PathBuf>,
    #[arg(long, global = true, value_enum)]
    mode: Option<LaunchMode>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the CLI dependency if needed, start the backend and open the UI.
    Launch {
        #[arg(long, default_value_t = false)]
        no_browser: bool,
    },
    /// Make sure the CLI dependency is installed and print its path.
    Install,
    /// Block until the backend accepts TCP connections.
    WaitReady {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    Status,
    Stop {
        #[arg(long, default_value_t = 10)]
        timeout_sec: u64,
    },
    Doctor {
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    Paths,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Update {
        #[command(subcommand)]
        command: UpdateCommand,
    },
    Logs {
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Subcommand, Debug)]
enum UpdateCommand {
    Check,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    resources_dir: PathBuf,
    mode: LaunchMode,
    json: bool,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    severity: String,
    strict_fail: bool,
    message: String,
    remediation: String,
    details: serde_json::Value,
}

fn main() -> Result<(), DeskError> {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("GEMINIDESK_LOG", "info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let ctx = build_context(&cli)?;

    let result = match cli.command {
        Commands::Launch { no_browser } => handle_launch(&ctx, no_browser),
        Commands::Install => handle_install(&ctx),
        Commands::WaitReady {
            host,
            port,
            interval_ms,
            timeout_ms,
        } => handle_wait_ready(&ctx, host, port, interval_ms, timeout_ms),
        Commands::Status => handle_status(&ctx),
        Commands::Stop { timeout_sec } => handle_stop(&ctx, timeout_sec),
        Commands::Doctor { strict } => handle_doctor(&ctx, strict),
        Commands::Paths => handle_paths(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Update { command } => handle_update(&ctx, command),
        Commands::Logs { lines } => handle_logs(&ctx, lines),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
            if let Some(hint) = err.details().and_then(|details| details.hint) {
                eprintln!("hint: {hint}");
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Result<Context, DeskError> {
    Ok(Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        resources_dir: resolve_resources_dir(cli.resources_dir.as_ref()),
        mode: LaunchMode::resolve(cli.mode)?,
        json: cli.json,
    })
}

fn system_installer(
    ctx: &Context,
    cfg: &Config,
    platform: Platform,
) -> Result<DependencyInstaller<SystemCommandRunner, SystemTerminal>, DeskError> {
    let paths = resolve_paths(cfg)?;
    Ok(DependencyInstaller::new(
        cfg.dependency.clone(),
        &paths.cache_root,
        paths.auth_marker,
        ctx.mode,
        ctx.resources_dir.clone(),
        platform,
        SystemCommandRunner,
        SystemTerminal { platform },
    ))
}

fn handle_launch(ctx: &Context, no_browser: bool) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let paths = resolve_paths(&cfg)?;
    let platform = Platform::current()?;
    let lock = InstanceLock::acquire(paths.instance_pid_path())?;
    log::info!(
        "launching in {} mode on {} (resources {}, lock {})",
        ctx.mode.as_str(),
        platform.label(),
        ctx.resources_dir.display(),
        lock.path().display()
    );

    let window: Box<dyn MainWindow> = if no_browser || !cfg.ui.open_browser {
        Box::new(HeadlessWindow)
    } else {
        Box::new(BrowserWindow::new(platform))
    };
    let updates: Option<Arc<dyn UpdateChecker>> = if cfg.update.enabled {
        Some(Arc::new(GitHubReleaseChecker::new(&cfg.update.release_url)))
    } else {
        None
    };
    let parts = Collaborators {
        installer: Box::new(system_installer(ctx, &cfg, platform)?),
        spawner: Box::new(SystemSpawner::new(
            cfg.backend.clone(),
            paths.clone(),
            ctx.resources_dir.clone(),
            platform,
        )),
        connector: Arc::new(TcpConnector::default()),
        splash: Box::new(TerminalSplash::new()),
        window,
        updates,
    };
    let mut coordinator = Coordinator::new(
        CoordinatorSettings::from_config(&cfg, &paths),
        parts,
        EventJournal::open(paths.journal_path()),
    );
    spawn_signal_listener(coordinator.quit_handle())?;
    spawn_stdin_listener(coordinator.quit_handle());

    let mut outcome = coordinator.run()?;
    log::info!("lifecycle finished in phase {}", coordinator.phase().as_str());
    if let Some(err) = outcome.error.take() {
        return Err(err);
    }
    output(
        ctx,
        json!({
            "trigger": outcome.trigger.to_string(),
            "exit_code": outcome.exit_code(),
            "phases": outcome.phases,
            "forced_kills": outcome.forced_kills,
        }),
    )
}

fn handle_install(ctx: &Context) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let platform = Platform::current()?;
    let installer = system_installer(ctx, &cfg, platform)?;
    let mut splash = TerminalSplash::new();
    let executable = installer.ensure(&mut splash)?;
    output(
        ctx,
        json!({
            "executable": executable,
            "package": cfg.dependency.install_spec(),
            "authenticated": installer.is_authenticated(),
        }),
    )
}

fn handle_wait_ready(
    ctx: &Context,
    host: Option<String>,
    port: Option<u16>,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let interval = interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| cfg.lifecycle.poll_interval());
    let timeout = match timeout_ms {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => cfg.lifecycle.ready_timeout(),
    };
    let probe = ReadinessProbe::new(
        host.unwrap_or_else(|| cfg.backend.host.clone()),
        port.unwrap_or(cfg.backend.port),
    )
    .with_interval(interval)
    .with_timeout(timeout);
    let attempts = probe.wait(&TcpConnector::default())?;
    output(
        ctx,
        json!({"address": probe.address(), "ready": true, "attempts": attempts}),
    )
}

fn handle_status(ctx: &Context) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let paths = resolve_paths(&cfg)?;
    let launcher_pid = read_pid_file(&paths.instance_pid_path());
    let backend_pid = read_pid_file(&paths.backend_pid_path());
    let reachable = TcpConnector::default().attempt(&cfg.backend.host, cfg.backend.port);
    output(
        ctx,
        json!({
            "launcher": {
                "pid": launcher_pid,
                "running": launcher_pid.map(process_is_alive).unwrap_or(false),
            },
            "backend": {
                "pid": backend_pid,
                "running": backend_pid.map(process_is_alive).unwrap_or(false),
                "address": cfg.backend.address(),
                "reachable": reachable,
            },
            "ui_url": cfg.ui_url(),
        }),
    )
}

fn handle_stop(ctx: &Context, timeout_sec: u64) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let paths = resolve_paths(&cfg)?;
    let pid_path = paths.instance_pid_path();
    let pid = match read_pid_file(&pid_path) {
        Some(pid) if process_is_alive(pid) => pid,
        stale => {
            if stale.is_some() {
                let _ = fs::remove_file(&pid_path);
            }
            return output(ctx, json!({"running": false, "stopped": false}));
        }
    };
    request_shutdown(pid)?;
    if !wait_for_exit(pid, Duration::from_secs(timeout_sec)) {
        return Err(DeskError::Process(format!(
            "launcher pid {pid} did not exit within {timeout_sec}s"
        )));
    }
    output(ctx, json!({"running": false, "stopped": true, "pid": pid}))
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    strict_fail: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
    details: serde_json::Value,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        strict_fail,
        message: message.into(),
        remediation: remediation.into(),
        details,
    }
}

fn collect_doctor_checks(ctx: &Context, cfg: &Config) -> Result<Vec<DoctorCheck>, DeskError> {
    let mut checks = Vec::new();
    let platform = Platform::current()?;
    let paths = resolve_paths(cfg)?;

    let runtime = locate_runtime(ctx.mode, &ctx.resources_dir, &platform);
    checks.push(doctor_check(
        "package_runtime",
        runtime.is_ok(),
        "error",
        true,
        match &runtime {
            Ok(found) => format!("npm found at {}", found.npm.display()),
            Err(err) => err.to_string(),
        },
        if ctx.mode.is_packaged() {
            "Reinstall the application; the bundled Node.js runtime is missing."
        } else {
            "Install Node.js so that `npm` is on PATH."
        },
        json!({"mode": ctx.mode.as_str(), "bundled_npm": bundled_npm_path(&ctx.resources_dir, &platform)}),
    ));

    let layout = InstallLayout::new(&paths.cache_root, &cfg.dependency.executable, &platform);
    checks.push(doctor_check(
        "dependency_installed",
        layout.is_installed(),
        "warning",
        true,
        if layout.is_installed() {
            format!("{} is installed", cfg.dependency.package)
        } else {
            format!("{} is not installed yet", cfg.dependency.package)
        },
        "Run `geminidesk install` or launch once with network access.",
        json!({"executable": layout.executable}),
    ));

    let authenticated = paths.auth_marker.exists();
    checks.push(doctor_check(
        "dependency_authenticated",
        authenticated,
        "warning",
        true,
        if authenticated {
            "sign-in marker present".to_string()
        } else {
            format!("sign-in marker missing at {}", paths.auth_marker.display())
        },
        format!(
            "Run `{}` in a terminal and complete the sign-in.",
            layout.executable.display()
        ),
        json!({"auth_marker": paths.auth_marker}),
    ));

    let backend = backend_executable(&cfg.backend, &ctx.resources_dir, &platform);
    checks.push(doctor_check(
        "backend_executable",
        backend.is_file(),
        "error",
        true,
        if backend.is_file() {
            format!("backend found at {}", backend.display())
        } else {
            format!("backend executable not found at {}", backend.display())
        },
        "Reinstall the application or set backend.executable in the config.",
        json!({"path": backend, "bin_dir": platform.bin_dir_name()}),
    ));

    let port_in_use = TcpConnector::default().attempt(&cfg.backend.host, cfg.backend.port);
    checks.push(doctor_check(
        "backend_port_free",
        !port_in_use,
        "warning",
        true,
        if port_in_use {
            format!("{} already accepts connections", cfg.backend.address())
        } else {
            format!("{} is free", cfg.backend.address())
        },
        "Stop whatever is listening there (`geminidesk stop`) or change backend.port.",
        json!({"address": cfg.backend.address()}),
    ));

    Ok(checks)
}

fn handle_doctor(ctx: &Context, strict: bool) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let checks = collect_doctor_checks(ctx, &cfg)?;
    let has_error = checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");
    let has_strict_warning = checks.iter().any(|check| !check.ok && check.strict_fail);
    let ok = !has_error && (!strict || !has_strict_warning);
    let primary_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .or_else(|| {
            checks
                .iter()
                .find(|check| !check.ok && strict && check.strict_fail)
        })
        .map(|check| check.message.clone());

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks, "strict": strict })),
            error: if ok { None } else { primary_error },
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok { "ok" } else { "fail" };
        println!(
            "[{}] {} ({}) - {}",
            state, check.id, check.severity, check.message
        );
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    if ok {
        return Ok(());
    }
    Err(DeskError::Process(primary_error.unwrap_or_else(|| {
        "one or more readiness checks failed".to_string()
    })))
}

fn handle_paths(ctx: &Context) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let paths = resolve_paths(&cfg)?;
    let platform = Platform::current()?;
    let layout = InstallLayout::new(&paths.cache_root, &cfg.dependency.executable, &platform);
    output(
        ctx,
        json!({
            "config_path": ctx.config_path,
            "config_exists": ctx.config_path.exists(),
            "mode": ctx.mode.as_str(),
            "platform": platform.label(),
            "resources_dir": ctx.resources_dir,
            "bundled_npm": bundled_npm_path(&ctx.resources_dir, &platform),
            "backend_executable": backend_executable(&cfg.backend, &ctx.resources_dir, &platform),
            "cache_root": paths.cache_root,
            "dependency_executable": layout.executable,
            "auth_marker": paths.auth_marker,
            "state_dir": paths.state_dir,
            "instance_pid_path": paths.instance_pid_path(),
            "backend_pid_path": paths.backend_pid_path(),
            "journal_path": paths.journal_path(),
            "generations_dir": paths.generations_dir,
            "backend_log_file": paths.backend_log_file,
            "ui_url": cfg.ui_url(),
        }),
    )
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), DeskError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
    }
}

fn handle_update(ctx: &Context, command: UpdateCommand) -> Result<(), DeskError> {
    match command {
        UpdateCommand::Check => {
            let cfg = load_config(&ctx.config_path)?;
            let status = GitHubReleaseChecker::new(&cfg.update.release_url).check()?;
            output(ctx, serde_json::to_value(&status)?)
        }
    }
}

fn handle_logs(ctx: &Context, lines: usize) -> Result<(), DeskError> {
    let cfg = load_config(&ctx.config_path)?;
    let paths = resolve_paths(&cfg)?;
    let records = journal::tail(&paths.journal_path(), lines)?;
    if ctx.json {
        return output(ctx, json!({"path": paths.journal_path(), "records": records}));
    }
    for record in &records {
        println!(
            "{} [{}] {} {}",
            record.ts, record.severity, record.event_type, record.payload
        );
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), DeskError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), DeskError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

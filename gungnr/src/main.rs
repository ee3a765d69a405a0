use clap::{Parser, Subcommand};
use dialoguer::console::style;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod command;
mod keepalive;
mod supervisor;

use command::SystemRunner;
use keepalive::KeepaliveContext;

const LOG_FILTER_ENV: &str = "GUNGNR_LOG";

#[derive(Parser, Debug)]
#[command(name = "gungnr", version, about = "Gungnr host CLI")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reboot-safe recovery of the core stack and cloudflared tunnel.
    Keepalive {
        #[command(subcommand)]
        command: KeepaliveCommand,
    },
}

#[derive(Subcommand, Debug)]
enum KeepaliveCommand {
    /// Install the supervisor and recover the core stack on boot.
    Enable,
    /// Install the supervisor in `all` mode and run one recovery now.
    All,
    /// Run one recovery pass using the persisted mode.
    Recover,
    /// Remove supervisor artifacts and keepalive state.
    Disable,
    /// Show supervisor configuration and the last recovery run.
    Status,
}

#[derive(Debug, Error)]
pub(crate) enum GungnrError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    NotInstalled(String),
    #[error("keepalive recovery already running")]
    AlreadyRunning,
    #[error("{message}")]
    Precondition { check: &'static str, message: String },
    #[error("{message}")]
    Phase { phase: &'static str, message: String },
    #[error("{}", persistence_display(.run_error, .message))]
    Persistence {
        message: String,
        run_error: Option<String>,
    },
}

impl GungnrError {
    /// The message without its category prefix, for embedding in other messages.
    pub(crate) fn detail(&self) -> String {
        match self {
            GungnrError::Config(message)
            | GungnrError::Process(message)
            | GungnrError::NotInstalled(message) => message.clone(),
            GungnrError::Precondition { message, .. } | GungnrError::Phase { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    /// Stable label for the failing stage, surfaced as `error_kind` in JSON output.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            GungnrError::Config(_) => "config",
            GungnrError::Io(_) => "io",
            GungnrError::Yaml(_) => "yaml",
            GungnrError::Json(_) => "json",
            GungnrError::Process(_) => "process",
            GungnrError::Http(_) => "http",
            GungnrError::NotInstalled(_) => "not_installed",
            GungnrError::AlreadyRunning => "already_running",
            GungnrError::Precondition { check, .. } => *check,
            GungnrError::Phase { phase, .. } => *phase,
            GungnrError::Persistence { .. } => "persistence",
        }
    }
}

fn persistence_display(run_error: &Option<String>, message: &str) -> String {
    match run_error {
        Some(run_error) => format!("{run_error}; {message}"),
        None => message.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
}

#[derive(Debug)]
pub(crate) struct Section {
    title: String,
    lines: Vec<String>,
}

/// Command output: human sections plus the structured payload used with `--json`.
#[derive(Debug)]
pub(crate) struct Report {
    title: String,
    sections: Vec<Section>,
    payload: serde_json::Value,
    failure: Option<GungnrError>,
}

impl Report {
    pub(crate) fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            sections: Vec::new(),
            payload: serde_json::Value::Null,
            failure: None,
        }
    }

    pub(crate) fn section(mut self, title: &str, lines: Vec<String>) -> Self {
        self.sections.push(Section {
            title: title.to_string(),
            lines,
        });
        self
    }

    pub(crate) fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// A report that still prints, but makes the command exit non-zero.
    pub(crate) fn failure(mut self, failure: Option<GungnrError>) -> Self {
        self.failure = failure;
        self
    }

    fn render(&self, styled: bool) -> String {
        let heading = |text: &str| {
            if styled {
                style(text).bold().to_string()
            } else {
                text.to_string()
            }
        };
        let mut out = if styled {
            style(&self.title).bold().cyan().to_string()
        } else {
            self.title.clone()
        };
        for section in &self.sections {
            let lines = unique_non_empty(&section.lines);
            if lines.is_empty() {
                continue;
            }
            out.push_str("\n\n");
            out.push_str(&heading(&section.title));
            for line in lines {
                out.push_str("\n- ");
                out.push_str(&line);
            }
        }
        out
    }
}

fn main() -> Result<(), GungnrError> {
    let cli = Cli::parse();
    init_tracing();
    let runner = SystemRunner;

    let result = match cli.command {
        Commands::Keepalive { command } => handle_keepalive(command, &runner),
    };

    let failure = match result {
        Ok(report) => {
            if cli.json {
                let payload = JsonResult {
                    ok: report.failure.is_none(),
                    result: Some(&report.payload),
                    error: report.failure.as_ref().map(ToString::to_string),
                    error_kind: report.failure.as_ref().map(GungnrError::kind),
                };
                print_json(&payload)?;
                if report.failure.is_some() {
                    std::process::exit(1);
                }
                return Ok(());
            }
            println!("{}", report.render(io::stdout().is_terminal()));
            report.failure
        }
        Err(err) => {
            if cli.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind()),
                };
                print_json(&payload)?;
                std::process::exit(1);
            }
            Some(err)
        }
    };

    if let Some(err) = failure {
        eprintln!("{err}");
        std::process::exit(1);
    }
    Ok(())
}

fn handle_keepalive(
    command: KeepaliveCommand,
    runner: &SystemRunner,
) -> Result<Report, GungnrError> {
    match command {
        KeepaliveCommand::Enable => {
            keepalive::handle_enable(&KeepaliveContext::resolve(true)?, runner)
        }
        KeepaliveCommand::All => keepalive::handle_all(&KeepaliveContext::resolve(true)?, runner),
        KeepaliveCommand::Recover => {
            keepalive::handle_recover(&KeepaliveContext::resolve(false)?, runner)
        }
        KeepaliveCommand::Disable => {
            keepalive::handle_disable(&KeepaliveContext::resolve(false)?, runner)
        }
        KeepaliveCommand::Status => {
            keepalive::handle_status(&KeepaliveContext::resolve(false)?, runner)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), GungnrError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

pub(crate) fn bool_label(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

pub(crate) fn or_fallback(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => fallback.to_string(),
    }
}

/// Trimmed, non-empty values in first-seen order.
pub(crate) fn unique_non_empty<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    values
        .into_iter()
        .filter_map(|value| {
            let value = value.as_ref().trim();
            (!value.is_empty() && seen.insert(value.to_string())).then(|| value.to_string())
        })
        .collect()
}

fn ensure_parent(path: &Path) -> Result<(), GungnrError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub(crate) fn file_exists(path: &Path) -> bool {
    fs::metadata(path).map(|meta| !meta.is_dir()).unwrap_or(false)
}

/// Removes a regular file. Missing files report `false`; directories are refused.
pub(crate) fn remove_file_if_exists(path: &Path) -> Result<bool, GungnrError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(GungnrError::Config(format!(
            "{} is a directory",
            path.display()
        ))),
        Ok(_) => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(GungnrError::Io(err)),
    }
}

pub(crate) fn shell_single_quote(value: &str) -> String {
    // foo'bar -> 'foo'\''bar'
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

pub(crate) fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), GungnrError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "gungnr".to_string()),
        std::process::id(),
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn shell_single_quote_escapes_embedded_quotes() {
        assert_eq!(shell_single_quote("foo'bar"), "'foo'\\''bar'");
        assert_eq!(shell_single_quote("/opt/my dir"), "'/opt/my dir'");
    }

    #[cfg(unix)]
    #[test]
    fn write_atomic_text_file_sets_mode_and_replaces() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("keepalive-mode");
        write_atomic_text_file(&path, "core\n", Some(0o600)).unwrap();
        write_atomic_text_file(&path, "all\n", Some(0o600)).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "all\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn remove_file_if_exists_reports_removal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keepalive.lock");
        assert!(!remove_file_if_exists(&path).unwrap());
        fs::write(&path, "pid=1\n").unwrap();
        assert!(remove_file_if_exists(&path).unwrap());
        assert!(!path.exists());
        let err = remove_file_if_exists(dir.path()).unwrap_err();
        assert!(err.to_string().ends_with("is a directory"));
    }

    #[test]
    fn persistence_error_keeps_run_error_first() {
        let err = GungnrError::Persistence {
            message: "persist keepalive metadata: disk full".to_string(),
            run_error: Some("health check returned status 502".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "health check returned status 502; persist keepalive metadata: disk full"
        );
        let alone = GungnrError::Persistence {
            message: "persist keepalive metadata: disk full".to_string(),
            run_error: None,
        };
        assert_eq!(alone.to_string(), "persist keepalive metadata: disk full");
        assert_eq!(alone.kind(), "persistence");
        assert_eq!(
            GungnrError::Process("docker info failed".to_string()).detail(),
            "docker info failed"
        );
        let precondition = GungnrError::Precondition {
            check: "cloudflared config",
            message: "cloudflared config not found at /tmp/config.yml".to_string(),
        };
        assert_eq!(precondition.kind(), "cloudflared config");
    }

    #[test]
    fn report_render_skips_empty_sections_and_dedupes() {
        let report = Report::new("Keepalive Status")
            .section("Configuration", vec!["Mode: core".to_string(), "Mode: core".to_string()])
            .section("Remediation", Vec::new())
            .section("Paths", vec![" ".to_string(), "Log: /tmp/keepalive.log".to_string()]);
        assert_eq!(
            report.render(false),
            "Keepalive Status\n\nConfiguration\n- Mode: core\n\nPaths\n- Log: /tmp/keepalive.log"
        );
    }

    #[test]
    fn unique_non_empty_keeps_first_seen_order() {
        assert_eq!(
            unique_non_empty(["b", " a ", "", "b", "a"]),
            vec!["b".to_string(), "a".to_string()]
        );
    }
}

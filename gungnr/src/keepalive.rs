#[cfg(test)]
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::command::{run_checked, CommandRunner, CommandSpec};
use crate::supervisor::{
    SetupResult, Supervisor, SupervisorKind, SupervisorPaths, SupervisorStatus, KEEPALIVE_LOG_NAME,
    LOCK_FILE_NAME,
};
use crate::{
    bool_label, file_exists, or_fallback, remove_file_if_exists, unique_non_empty,
    write_atomic_text_file, GungnrError, Report,
};

const MODE_FILE_NAME: &str = "keepalive-mode";
const COMPOSE_POINTER_FILE_NAME: &str = "keepalive-compose-file";
const LAST_RUN_FILE_NAME: &str = "keepalive-last-run.json";
const COMPOSE_LOG_NAME: &str = "docker-compose.log";
const TUNNEL_LOG_NAME: &str = "cloudflared.log";
const STATE_FILE_MODE: u32 = 0o600;

pub(crate) const DEFAULT_HEALTH_URL: &str = "http://localhost/healthz";
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const TUNNEL_READY_ATTEMPTS: u32 = 10;
const TUNNEL_READY_INTERVAL: Duration = Duration::from_millis(500);

const DEFAULT_API_HEALTH_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MANAGED_RETRY_COUNT: u64 = 3;
const DEFAULT_MANAGED_BACKOFF_SECONDS: u64 = 3;
const DEFAULT_MANAGED_TIMEOUT_SECONDS: u64 = 45;
const MAX_CONTROL_SECONDS: u64 = 24 * 60 * 60;
const MAX_MANAGED_RETRY_COUNT: u64 = 100;

const COMPOSE_FILE_KEY: &str = "GUNGNR_COMPOSE_FILE";
const TRIGGER_KEY: &str = "GUNGNR_KEEPALIVE_TRIGGER";
const HEALTH_URL_KEY: &str = "GUNGNR_HEALTH_URL";

/// Keys read from the process environment. They take precedence over the bootstrap `.env`.
const KNOWN_KEYS: [&str; 9] = [
    "KEEPALIVE_API_HEALTH_TIMEOUT_SECONDS",
    "KEEPALIVE_MANAGED_RETRY_COUNT",
    "KEEPALIVE_MANAGED_BACKOFF_SECONDS",
    "KEEPALIVE_MANAGED_TIMEOUT_SECONDS",
    COMPOSE_FILE_KEY,
    TRIGGER_KEY,
    HEALTH_URL_KEY,
    "CLOUDFLARED_DIR",
    "CLOUDFLARED_CONFIG",
];

const CORE_SERVICES: [&str; 4] = ["db", "api", "web", "proxy"];
const CORE_SERVICE_THRESHOLD: usize = 3;
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum KeepaliveMode {
    Core,
    All,
}

impl KeepaliveMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            KeepaliveMode::Core => "core",
            KeepaliveMode::All => "all",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "core" => Some(KeepaliveMode::Core),
            "all" => Some(KeepaliveMode::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum StateKey {
    Mode,
    ComposeFile,
    LastRun,
}

impl StateKey {
    fn file_name(self) -> &'static str {
        match self {
            StateKey::Mode => MODE_FILE_NAME,
            StateKey::ComposeFile => COMPOSE_POINTER_FILE_NAME,
            StateKey::LastRun => LAST_RUN_FILE_NAME,
        }
    }
}

pub(crate) trait StateStore {
    /// Trimmed value, or `None` when unset or blank.
    fn get(&self, key: StateKey) -> Result<Option<String>, GungnrError>;
    fn set(&self, key: StateKey, value: &str) -> Result<(), GungnrError>;
    /// Returns whether something was removed.
    fn delete(&self, key: StateKey) -> Result<bool, GungnrError>;
}

pub(crate) struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub(crate) fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub(crate) fn path(&self, key: StateKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: StateKey) -> Result<Option<String>, GungnrError> {
        match fs::read_to_string(self.path(key)) {
            Ok(content) => {
                let trimmed = content.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(GungnrError::Io(err)),
        }
    }

    fn set(&self, key: StateKey, value: &str) -> Result<(), GungnrError> {
        let mut content = value.trim_end().to_string();
        content.push('\n');
        write_atomic_text_file(&self.path(key), &content, Some(STATE_FILE_MODE))
    }

    fn delete(&self, key: StateKey) -> Result<bool, GungnrError> {
        remove_file_if_exists(&self.path(key))
    }
}

fn read_mode<S: StateStore>(store: &S) -> Option<KeepaliveMode> {
    store
        .get(StateKey::Mode)
        .ok()
        .flatten()
        .and_then(|value| KeepaliveMode::parse(&value))
}

fn read_compose_pointer<S: StateStore>(store: &S) -> Option<String> {
    store.get(StateKey::ComposeFile).ok().flatten()
}

pub(crate) fn read_last_run<S: StateStore>(store: &S) -> Result<Option<RecoveryRun>, GungnrError> {
    let Some(text) = store.get(StateKey::LastRun)? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|err| GungnrError::Config(format!("parse keepalive last-run payload: {err}")))
}

fn persist_last_run<S: StateStore>(store: &S, run: &RecoveryRun) -> Result<(), GungnrError> {
    let payload = serde_json::to_string_pretty(run)?;
    store.set(StateKey::LastRun, &payload)
}

#[derive(Debug, Clone, Default)]
pub(crate) struct KeepaliveEnv {
    process: BTreeMap<String, String>,
    file: BTreeMap<String, String>,
}

impl KeepaliveEnv {
    #[cfg(test)]
    pub(crate) fn new(process: BTreeMap<String, String>, file: BTreeMap<String, String>) -> Self {
        Self { process, file }
    }

    /// Snapshot of the known keys from the process environment layered over `file`.
    fn capture(file: BTreeMap<String, String>) -> Self {
        let process = KNOWN_KEYS
            .iter()
            .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self { process, file }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        [self.process.get(key), self.file.get(key)]
            .into_iter()
            .flatten()
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
    }
}

fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>, GungnrError> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(err) if err.not_found() => return Ok(BTreeMap::new()),
        Err(err) => {
            return Err(GungnrError::Config(format!(
                "unable to read {}: {err}",
                path.display()
            )))
        }
    };
    let mut values = BTreeMap::new();
    for item in iter {
        let (key, value) = item.map_err(|err| {
            GungnrError::Config(format!("unable to parse {}: {err}", path.display()))
        })?;
        values.insert(key, value);
    }
    Ok(values)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RunControls {
    pub(crate) api_health_timeout_seconds: u64,
    pub(crate) managed_retry_count: u64,
    pub(crate) managed_backoff_seconds: u64,
    pub(crate) managed_start_timeout_seconds: u64,
    pub(crate) api_health_timeout_raw: String,
    pub(crate) managed_backoff_raw: String,
    pub(crate) managed_start_timeout_raw: String,
}

impl Default for RunControls {
    fn default() -> Self {
        Self::new(
            DEFAULT_API_HEALTH_TIMEOUT_SECONDS,
            DEFAULT_MANAGED_RETRY_COUNT,
            DEFAULT_MANAGED_BACKOFF_SECONDS,
            DEFAULT_MANAGED_TIMEOUT_SECONDS,
        )
    }
}

impl RunControls {
    fn new(health: u64, retries: u64, backoff: u64, start_timeout: u64) -> Self {
        Self {
            api_health_timeout_seconds: health,
            managed_retry_count: retries,
            managed_backoff_seconds: backoff,
            managed_start_timeout_seconds: start_timeout,
            api_health_timeout_raw: format!("{health}s"),
            managed_backoff_raw: format!("{backoff}s"),
            managed_start_timeout_raw: format!("{start_timeout}s"),
        }
    }

    pub(crate) fn from_env(env: &KeepaliveEnv) -> Self {
        Self::new(
            positive_setting(
                env,
                "KEEPALIVE_API_HEALTH_TIMEOUT_SECONDS",
                DEFAULT_API_HEALTH_TIMEOUT_SECONDS,
                MAX_CONTROL_SECONDS,
            ),
            positive_setting(
                env,
                "KEEPALIVE_MANAGED_RETRY_COUNT",
                DEFAULT_MANAGED_RETRY_COUNT,
                MAX_MANAGED_RETRY_COUNT,
            ),
            positive_setting(
                env,
                "KEEPALIVE_MANAGED_BACKOFF_SECONDS",
                DEFAULT_MANAGED_BACKOFF_SECONDS,
                MAX_CONTROL_SECONDS,
            ),
            positive_setting(
                env,
                "KEEPALIVE_MANAGED_TIMEOUT_SECONDS",
                DEFAULT_MANAGED_TIMEOUT_SECONDS,
                MAX_CONTROL_SECONDS,
            ),
        )
    }

    fn api_health_timeout(&self) -> Duration {
        Duration::from_secs(self.api_health_timeout_seconds)
    }

    fn managed_backoff(&self) -> Duration {
        Duration::from_secs(self.managed_backoff_seconds)
    }

    fn managed_start_timeout(&self) -> Duration {
        Duration::from_secs(self.managed_start_timeout_seconds)
    }
}

/// Positive integers are clamped to `max`; anything else yields `fallback`.
fn positive_setting(env: &KeepaliveEnv, key: &str, fallback: u64, max: u64) -> u64 {
    match env.get(key).map(str::parse::<i64>) {
        Some(Ok(value)) if value > 0 => value.unsigned_abs().min(max),
        _ => fallback,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RunResult {
    Success,
    Failed,
}

impl RunResult {
    fn as_str(self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct RecoveryOutcome {
    pub(crate) core_recovered: bool,
    pub(crate) api_healthy: bool,
    pub(crate) tunnel_started: bool,
    pub(crate) managed_recovery_attempted: bool,
    pub(crate) managed_projects: usize,
    pub(crate) managed_projects_recovered: usize,
    pub(crate) managed_projects_failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) failed_projects: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) failed_project_errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) core_project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) compose_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) core_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) health_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) managed_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RecoveryRun {
    pub(crate) mode: KeepaliveMode,
    pub(crate) trigger: String,
    pub(crate) result: RunResult,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) finished_at: DateTime<Utc>,
    pub(crate) duration_sec: i64,
    pub(crate) controls: RunControls,
    pub(crate) recovery: RecoveryOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) remediation: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

/// Append-only `keepalive.log` writer. Every line is mirrored to tracing.
pub(crate) struct RunLogger {
    file: File,
}

impl RunLogger {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(STATE_FILE_MODE);
        Ok(Self {
            file: options.open(path)?,
        })
    }

    pub(crate) fn info(&self, phase: &str, message: &str) {
        self.log(Level::Info, phase, message);
    }

    pub(crate) fn warn(&self, phase: &str, message: &str) {
        self.log(Level::Warn, phase, message);
    }

    pub(crate) fn error(&self, phase: &str, message: &str) {
        self.log(Level::Error, phase, message);
    }

    fn log(&self, level: Level, phase: &str, message: &str) {
        let label = match level {
            Level::Info => {
                info!(phase, "{message}");
                "info"
            }
            Level::Warn => {
                warn!(phase, "{message}");
                "warn"
            }
            Level::Error => {
                error!(phase, "{message}");
                "error"
            }
        };
        let line = format!(
            "{} level={label} phase={phase} msg={message:?}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if let Err(err) = (&self.file).write_all(line.as_bytes()) {
            warn!(error = %err, "failed to append keepalive log line");
        }
    }
}

/// Advisory lock held for one recovery run. Released when dropped.
pub(crate) struct RunLock {
    file: File,
}

impl RunLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self, GungnrError> {
        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true);
        #[cfg(unix)]
        options.mode(STATE_FILE_MODE);
        let mut file = options.open(path).map_err(|err| GungnrError::Persistence {
            message: format!("open keepalive lock file {}: {err}", path.display()),
            run_error: None,
        })?;
        if let Err(err) = file.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(GungnrError::AlreadyRunning);
            }
            return Err(GungnrError::Persistence {
                message: format!("acquire keepalive lock {}: {err}", path.display()),
                run_error: None,
            });
        }
        let holder = format!(
            "pid={} started_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        if file.set_len(0).is_ok() && file.seek(SeekFrom::Start(0)).is_ok() {
            let _ = file.write_all(holder.as_bytes());
        }
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ComposeContainer {
    pub(crate) id: String,
    pub(crate) project: String,
    pub(crate) service: String,
}

#[derive(Debug, Deserialize)]
struct DockerPsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

/// Parses `docker ps --format '{{json .}}'` output, keeping compose-managed containers only.
pub(crate) fn parse_compose_containers(output: &str) -> Result<Vec<ComposeContainer>, GungnrError> {
    let mut containers = Vec::new();
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let entry: DockerPsLine = serde_json::from_str(line).map_err(|err| {
            GungnrError::Process(format!("parse docker ps entry: {err}"))
        })?;
        let labels = parse_docker_labels(&entry.labels);
        let project = labels.get(COMPOSE_PROJECT_LABEL).cloned().unwrap_or_default();
        if project.is_empty() {
            continue;
        }
        containers.push(ComposeContainer {
            id: entry.id.trim().to_string(),
            project,
            service: labels.get(COMPOSE_SERVICE_LABEL).cloned().unwrap_or_default(),
        });
    }
    Ok(containers)
}

fn parse_docker_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// The project carrying the most of the core services, when it has at least three.
/// Ties go to the larger container count, then the smaller name.
pub(crate) fn find_core_project(containers: &[ComposeContainer]) -> Option<String> {
    let mut services: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for container in containers {
        let project = container.project.trim();
        if project.is_empty() {
            continue;
        }
        *counts.entry(project).or_default() += 1;
        let service = container.service.trim().to_lowercase();
        let entry = services.entry(project).or_default();
        if !service.is_empty() {
            entry.insert(service);
        }
    }

    let mut best: Option<(&str, usize, usize)> = None;
    // BTreeMap iteration is name-ordered, so a strict comparison keeps the smaller name on ties.
    for (project, found) in &services {
        let score = CORE_SERVICES
            .iter()
            .filter(|service| found.contains(**service))
            .count();
        if score < CORE_SERVICE_THRESHOLD {
            continue;
        }
        let count = counts.get(project).copied().unwrap_or_default();
        let better = match best {
            None => true,
            Some((_, best_score, best_count)) => {
                score > best_score || (score == best_score && count > best_count)
            }
        };
        if better {
            best = Some((project, score, count));
        }
    }
    best.map(|(project, _, _)| project.to_string())
}

/// Container ids per non-core project, deduplicated, keyed in name order.
pub(crate) fn group_managed_projects(
    containers: &[ComposeContainer],
    core_project: &str,
) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for container in containers {
        let project = container.project.trim();
        let id = container.id.trim();
        if project.is_empty() || id.is_empty() || project.eq_ignore_ascii_case(core_project) {
            continue;
        }
        let ids = grouped.entry(project.to_string()).or_default();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    grouped
}

/// Structured view of the host the recovery phases act on.
pub(crate) trait RecoveryHost {
    fn check_docker(&self) -> Result<(), GungnrError>;
    fn check_compose(&self) -> Result<(), GungnrError>;
    fn check_cloudflared(&self) -> Result<(), GungnrError>;
    fn compose_up(&self, compose_file: &Path, env_file: &Path) -> Result<(), GungnrError>;
    /// Returns `true` when a new tunnel process had to be started.
    fn ensure_tunnel(&self, config_path: &Path) -> Result<bool, GungnrError>;
    fn list_compose_containers(&self) -> Result<Vec<ComposeContainer>, GungnrError>;
    fn start_containers(&self, ids: &[String], timeout: Duration) -> Result<(), GungnrError>;
    /// HTTP status of one health request.
    fn probe_health(&self, url: &str) -> Result<u16, GungnrError>;

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

pub(crate) struct SystemHost<'a, R: CommandRunner> {
    runner: &'a R,
    compose_log: PathBuf,
    tunnel_log: PathBuf,
    client: reqwest::blocking::Client,
}

impl<'a, R: CommandRunner> SystemHost<'a, R> {
    pub(crate) fn new(runner: &'a R, paths: &KeepalivePaths) -> Result<Self, GungnrError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            runner,
            compose_log: paths.compose_log(),
            tunnel_log: paths.tunnel_log(),
            client,
        })
    }

    fn succeeds(&self, spec: &CommandSpec) -> bool {
        self.runner
            .run(spec)
            .map(|output| output.success())
            .unwrap_or(false)
    }

    fn compose_command(&self) -> Option<CommandSpec> {
        if self.succeeds(&CommandSpec::new("docker").args(["compose", "version"])) {
            return Some(CommandSpec::new("docker").arg("compose"));
        }
        if self.runner.locate("docker-compose").is_some()
            && self.succeeds(&CommandSpec::new("docker-compose").arg("version"))
        {
            return Some(CommandSpec::new("docker-compose"));
        }
        None
    }

    fn tunnel_pids(&self, config_path: &Path) -> Result<Vec<u32>, GungnrError> {
        let pattern = format!(
            "cloudflared.*--config[[:space:]]+{}[[:space:]]+run",
            regex_quote(&config_path.to_string_lossy())
        );
        let output = self
            .runner
            .run(&CommandSpec::new("pgrep").arg("-f").arg(pattern))
            .map_err(|err| GungnrError::Process(format!("pgrep cloudflared: {err}")))?;
        let text = output.combined_text();
        if !output.success() {
            if text.is_empty() {
                return Ok(Vec::new());
            }
            return Err(GungnrError::Process(format!("pgrep cloudflared: {text}")));
        }
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<u32>().map_err(|err| {
                    GungnrError::Process(format!("parse cloudflared pid {line:?}: {err}"))
                })
            })
            .collect()
    }

    fn append_compose_log(&self, command: &str, body: &str) -> Result<(), GungnrError> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.compose_log)?;
        writeln!(
            log,
            "==> {} {command}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )?;
        if !body.is_empty() {
            writeln!(log, "{body}")?;
        }
        Ok(())
    }
}

impl<'a, R: CommandRunner> RecoveryHost for SystemHost<'a, R> {
    fn check_docker(&self) -> Result<(), GungnrError> {
        if self.runner.locate("docker").is_none() {
            return Err(GungnrError::Process(
                "docker not found in PATH. Install Docker and retry".to_string(),
            ));
        }
        run_checked(self.runner, &CommandSpec::new("docker").arg("info"))
            .map(|_| ())
            .map_err(|err| GungnrError::Process(format!("docker access failed: {}", err.detail())))
    }

    fn check_compose(&self) -> Result<(), GungnrError> {
        self.compose_command().map(|_| ()).ok_or_else(|| {
            GungnrError::Process(
                "docker compose not available. Install Docker Compose v2 (docker compose) or docker-compose"
                    .to_string(),
            )
        })
    }

    fn check_cloudflared(&self) -> Result<(), GungnrError> {
        if self.runner.locate("cloudflared").is_none() {
            return Err(GungnrError::Process(
                "cloudflared not found in PATH. Install cloudflared and retry".to_string(),
            ));
        }
        run_checked(self.runner, &CommandSpec::new("cloudflared").arg("--version"))
            .map(|_| ())
            .map_err(|err| {
                GungnrError::Process(format!("cloudflared check failed: {}", err.detail()))
            })
    }

    fn compose_up(&self, compose_file: &Path, env_file: &Path) -> Result<(), GungnrError> {
        let base = self.compose_command().ok_or_else(|| {
            GungnrError::Process("docker compose not available".to_string())
        })?;
        let mut spec = base
            .arg("--env-file")
            .arg(env_file.to_string_lossy())
            .arg("-f")
            .arg(compose_file.to_string_lossy())
            .args(["up", "-d"]);
        if let Some(dir) = compose_file.parent() {
            spec = spec.cwd(dir);
        }
        let command = spec.render();
        let output = self.runner.run(&spec).map_err(|err| {
            GungnrError::Process(format!("failed to run command `{command}`: {err}"))
        })?;
        self.append_compose_log(&command, &output.combined_text())?;
        if !output.success() {
            return Err(GungnrError::Process(format!(
                "command failed with status {} while running `{command}`; see {}",
                output.status_code,
                self.compose_log.display()
            )));
        }
        Ok(())
    }

    fn ensure_tunnel(&self, config_path: &Path) -> Result<bool, GungnrError> {
        if !self.tunnel_pids(config_path)?.is_empty() {
            return Ok(false);
        }
        let spec = CommandSpec::new("cloudflared")
            .args(["tunnel", "--config"])
            .arg(config_path.to_string_lossy())
            .arg("run");
        self.runner
            .spawn_detached(&spec, &self.tunnel_log)
            .map_err(|err| GungnrError::Process(format!("cloudflared tunnel run failed: {err}")))?;
        for attempt in 0..TUNNEL_READY_ATTEMPTS {
            if !self.tunnel_pids(config_path)?.is_empty() {
                return Ok(true);
            }
            if attempt + 1 < TUNNEL_READY_ATTEMPTS {
                self.sleep(TUNNEL_READY_INTERVAL);
            }
        }
        Err(GungnrError::Process(format!(
            "cloudflared tunnel process did not stay running; see {}",
            self.tunnel_log.display()
        )))
    }

    fn list_compose_containers(&self) -> Result<Vec<ComposeContainer>, GungnrError> {
        let spec = CommandSpec::new("docker").args(["ps", "-a", "--format", "{{json .}}"]);
        let output = run_checked(self.runner, &spec).map_err(|err| {
            GungnrError::Process(format!("list docker containers: {}", err.detail()))
        })?;
        parse_compose_containers(&output.stdout_text())
    }

    fn start_containers(&self, ids: &[String], timeout: Duration) -> Result<(), GungnrError> {
        if ids.is_empty() {
            return Ok(());
        }
        let spec = CommandSpec::new("docker")
            .arg("start")
            .args(ids.iter().cloned())
            .timeout(timeout);
        run_checked(self.runner, &spec).map(|_| ()).map_err(|err| {
            GungnrError::Process(format!("start docker containers: {}", err.detail()))
        })
    }

    fn probe_health(&self, url: &str) -> Result<u16, GungnrError> {
        let response = self.client.get(url).send()?;
        Ok(response.status().as_u16())
    }
}

fn regex_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if "\\.^$|?*+()[]{}".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[derive(Debug, Clone)]
pub(crate) struct KeepalivePaths {
    pub(crate) env_file: PathBuf,
    pub(crate) cloudflared_config: PathBuf,
    pub(crate) state_dir: PathBuf,
    pub(crate) unit_dir: PathBuf,
}

impl KeepalivePaths {
    pub(crate) fn log_file(&self) -> PathBuf {
        self.state_dir.join(KEEPALIVE_LOG_NAME)
    }

    pub(crate) fn lock_file(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE_NAME)
    }

    pub(crate) fn last_run_file(&self) -> PathBuf {
        self.state_dir.join(LAST_RUN_FILE_NAME)
    }

    fn compose_log(&self) -> PathBuf {
        self.state_dir.join(COMPOSE_LOG_NAME)
    }

    fn tunnel_log(&self) -> PathBuf {
        self.state_dir.join(TUNNEL_LOG_NAME)
    }

    fn supervisor(&self) -> SupervisorPaths {
        SupervisorPaths {
            state_dir: self.state_dir.clone(),
            unit_dir: self.unit_dir.clone(),
        }
    }
}

pub(crate) struct KeepaliveContext {
    pub(crate) paths: KeepalivePaths,
    pub(crate) env: KeepaliveEnv,
    pub(crate) health_url: String,
}

impl KeepaliveContext {
    /// `require_config` demands the bootstrap `.env` and cloudflared config up front
    /// and creates the state directory.
    pub(crate) fn resolve(require_config: bool) -> Result<Self, GungnrError> {
        let home = dirs::home_dir();
        let data_dir = match env::var("GUNGNR_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
            _ => home
                .as_ref()
                .map(|home| home.join("gungnr"))
                .ok_or_else(|| {
                    GungnrError::Config("unable to resolve home directory".to_string())
                })?,
        };
        let env_file = data_dir.join(".env");
        let env = KeepaliveEnv::capture(read_env_file(&env_file)?);

        let cloudflared_dir = env
            .get("CLOUDFLARED_DIR")
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|home| home.join(".cloudflared")))
            .unwrap_or_else(|| PathBuf::from(".cloudflared"));
        let cloudflared_config = env
            .get("CLOUDFLARED_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| cloudflared_dir.join("config.yml"));
        let unit_dir = dirs::config_dir()
            .or_else(|| home.as_ref().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("systemd")
            .join("user");
        let health_url = env.get(HEALTH_URL_KEY).unwrap_or(DEFAULT_HEALTH_URL).to_string();

        let paths = KeepalivePaths {
            env_file,
            cloudflared_config,
            state_dir: data_dir.join("state"),
            unit_dir,
        };
        if require_config {
            require_file(&paths.env_file, "bootstrap env", "bootstrap .env not found at")?;
            require_file(
                &paths.cloudflared_config,
                "cloudflared config",
                "cloudflared config not found at",
            )?;
            fs::create_dir_all(&paths.state_dir)?;
        }
        Ok(Self {
            paths,
            env,
            health_url,
        })
    }
}

fn require_file(path: &Path, check: &'static str, missing: &str) -> Result<(), GungnrError> {
    match fs::metadata(path) {
        Ok(meta) if !meta.is_dir() => Ok(()),
        Ok(_) => Err(GungnrError::Precondition {
            check,
            message: format!("{} is a directory", path.display()),
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(GungnrError::Precondition {
            check,
            message: format!("{missing} {}", path.display()),
        }),
        Err(err) => Err(GungnrError::Precondition {
            check,
            message: format!("unable to access {}: {err}", path.display()),
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CloudflaredConfig {
    #[serde(default)]
    tunnel: Option<String>,
    #[serde(default, rename = "credentials-file")]
    credentials_file: Option<String>,
}

fn read_cloudflared_config(path: &Path) -> Result<CloudflaredConfig, GungnrError> {
    let text = fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(CloudflaredConfig::default());
    }
    Ok(serde_yaml::from_str(&text)?)
}

fn tunnel_label(config: &CloudflaredConfig) -> String {
    match (&config.tunnel, &config.credentials_file) {
        (Some(tunnel), Some(credentials)) => format!("{tunnel} (credentials: {credentials})"),
        (Some(tunnel), None) => tunnel.clone(),
        _ => "n/a".to_string(),
    }
}

fn validate_compose_path(path: &Path) -> Result<PathBuf, String> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(format!(
            "compose file path {} is a directory",
            path.display()
        )),
        Ok(_) => Ok(path.to_path_buf()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(format!("compose file not found at {}", path.display()))
        }
        Err(err) => Err(format!("unable to access compose file {}: {err}", path.display())),
    }
}

/// Recovery runs unattended, so the override must be absolute and valid on its own.
pub(crate) fn resolve_compose_for_recovery<S: StateStore>(
    env: &KeepaliveEnv,
    store: &S,
    pointer_path: &Path,
) -> Result<PathBuf, GungnrError> {
    let failure = |message: String| GungnrError::Precondition {
        check: "compose file",
        message,
    };
    if let Some(value) = env.get(COMPOSE_FILE_KEY) {
        let candidate = Path::new(value);
        if !candidate.is_absolute() {
            return Err(failure(format!(
                "{COMPOSE_FILE_KEY} is relative ({value:?}) and cannot be used for non-interactive recovery; set an absolute compose file path"
            )));
        }
        return validate_compose_path(candidate).map_err(|err| {
            failure(format!(
                "{COMPOSE_FILE_KEY} is set but invalid ({value:?}): {err}"
            ))
        });
    }
    let Some(persisted) = read_compose_pointer(store) else {
        return Err(failure(format!(
            "keepalive compose file path not configured at {}",
            pointer_path.display()
        )));
    };
    validate_compose_path(Path::new(&persisted)).map_err(|err| {
        failure(format!(
            "configured keepalive compose file {persisted:?} is invalid: {err}"
        ))
    })
}

/// Override (made absolute against `cwd`), then discovery upward from `cwd`, then the
/// previously persisted pointer.
pub(crate) fn resolve_compose_for_setup<S: StateStore>(
    env: &KeepaliveEnv,
    store: &S,
    cwd: &Path,
    env_file: &Path,
) -> Result<PathBuf, GungnrError> {
    if let Some(value) = env.get(COMPOSE_FILE_KEY) {
        return validate_compose_path(&cwd.join(value)).map_err(|err| {
            GungnrError::Config(format!("invalid {COMPOSE_FILE_KEY} value {value:?}: {err}"))
        });
    }
    let discovery = find_compose_file(cwd);
    if let Some(found) = &discovery {
        return Ok(found.clone());
    }
    if let Some(persisted) = read_compose_pointer(store) {
        if let Ok(resolved) = validate_compose_path(Path::new(&persisted)) {
            return Ok(resolved);
        }
    }
    Err(GungnrError::Precondition {
        check: "compose file",
        message: format!(
            "unable to resolve docker-compose.yml for keepalive setup: docker-compose.yml not found from {} upward. Run `gungnr keepalive enable` from the repo root or set {COMPOSE_FILE_KEY} in {}",
            cwd.display(),
            env_file.display()
        ),
    })
}

fn find_compose_file(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join("docker-compose.yml"))
        .find(|candidate| file_exists(candidate))
}

pub(crate) struct RecoveryEngine<'a, H: RecoveryHost, S: StateStore> {
    host: &'a H,
    store: &'a S,
    env: &'a KeepaliveEnv,
    paths: &'a KeepalivePaths,
    health_url: &'a str,
}

impl<'a, H: RecoveryHost, S: StateStore> RecoveryEngine<'a, H, S> {
    pub(crate) fn new(
        host: &'a H,
        store: &'a S,
        env: &'a KeepaliveEnv,
        paths: &'a KeepalivePaths,
        health_url: &'a str,
    ) -> Self {
        Self {
            host,
            store,
            env,
            paths,
            health_url,
        }
    }

    /// Runs one recovery and persists its record. The record is returned even on failure.
    pub(crate) fn execute(
        &self,
        mode: KeepaliveMode,
        trigger: &str,
    ) -> (RecoveryRun, Result<(), GungnrError>) {
        let started_at = Utc::now();
        let mut run = RecoveryRun {
            mode,
            trigger: trigger.to_string(),
            result: RunResult::Failed,
            started_at,
            finished_at: started_at,
            duration_sec: 0,
            controls: RunControls::from_env(self.env),
            recovery: RecoveryOutcome::default(),
            remediation: Vec::new(),
        };

        let log_path = self.paths.log_file();
        let logger = match RunLogger::open(&log_path) {
            Ok(logger) => logger,
            Err(err) => {
                let failure = GungnrError::Persistence {
                    message: format!("open keepalive log {}: {err}", log_path.display()),
                    run_error: None,
                };
                run.recovery.core_error = Some(failure.to_string());
                return self.finish(run, Err(failure));
            }
        };

        let lock = match RunLock::acquire(&self.paths.lock_file()) {
            Ok(lock) => lock,
            Err(err) => {
                logger.error("lock", &err.to_string());
                run.recovery.core_error = Some(err.to_string());
                return self.finish(run, Err(err));
            }
        };

        logger.info(
            "recovery",
            &format!(
                "starting keepalive recovery (mode={} trigger={trigger})",
                mode.as_str()
            ),
        );
        let outcome = self.recover(mode, &run.controls, &logger, &mut run.recovery);
        match &outcome {
            Ok(()) => logger.info("recovery", "keepalive recovery completed successfully"),
            Err(err) => logger.error("recovery", &err.to_string()),
        }
        let finished = self.finish(run, outcome);
        drop(lock);
        finished
    }

    fn finish(
        &self,
        mut run: RecoveryRun,
        outcome: Result<(), GungnrError>,
    ) -> (RecoveryRun, Result<(), GungnrError>) {
        run.result = if outcome.is_ok() {
            RunResult::Success
        } else {
            RunResult::Failed
        };
        run.remediation = run_remediation(&run.recovery);
        run.finished_at = Utc::now();
        run.duration_sec = (run.finished_at - run.started_at).num_seconds();

        match persist_last_run(self.store, &run) {
            Ok(()) => (run, outcome),
            Err(err) => {
                let failure = GungnrError::Persistence {
                    message: format!(
                        "persist keepalive metadata at {}: {}",
                        self.paths.last_run_file().display(),
                        err.detail()
                    ),
                    run_error: outcome.err().map(|err| err.to_string()),
                };
                (run, Err(failure))
            }
        }
    }

    fn recover(
        &self,
        mode: KeepaliveMode,
        controls: &RunControls,
        logger: &RunLogger,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), GungnrError> {
        if let Err(err) = self.recover_core(logger, outcome) {
            let message = err.detail();
            logger.error("core", &message);
            outcome.core_error = Some(message);
            return Err(err);
        }
        outcome.core_recovered = true;

        logger.info(
            "health",
            &format!(
                "waiting for API health ({} timeout={})",
                self.health_url, controls.api_health_timeout_raw
            ),
        );
        if let Err(err) = self.wait_for_health(controls.api_health_timeout()) {
            let message = err.detail();
            logger.error("health", &message);
            outcome.health_error = Some(message);
            return Err(err);
        }
        outcome.api_healthy = true;

        if mode == KeepaliveMode::Core {
            logger.info("managed", "mode is core; skipping managed project recovery");
            return Ok(());
        }
        self.recover_managed(controls, logger, outcome)
    }

    fn recover_core(
        &self,
        logger: &RunLogger,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), GungnrError> {
        let pointer = FileStateStore::new(&self.paths.state_dir).path(StateKey::ComposeFile);
        let compose_file = resolve_compose_for_recovery(self.env, self.store, &pointer)?;
        outcome.compose_file = Some(compose_file.display().to_string());

        require_file(&self.paths.env_file, "bootstrap env", "bootstrap .env not found at")?;
        require_file(
            &self.paths.cloudflared_config,
            "cloudflared config",
            "cloudflared config not found at",
        )?;
        self.host.check_docker().map_err(|err| precondition("docker", err))?;
        self.host.check_compose().map_err(|err| precondition("docker compose", err))?;
        self.host
            .check_cloudflared()
            .map_err(|err| precondition("cloudflared", err))?;

        logger.info(
            "core",
            &format!("ensuring compose stack with {}", compose_file.display()),
        );
        self.host
            .compose_up(&compose_file, &self.paths.env_file)
            .map_err(|err| phase_error("core", err))?;

        logger.info(
            "core",
            &format!(
                "ensuring cloudflared tunnel process from {}",
                self.paths.cloudflared_config.display()
            ),
        );
        let started = self
            .host
            .ensure_tunnel(&self.paths.cloudflared_config)
            .map_err(|err| phase_error("core", err))?;
        outcome.tunnel_started = started;
        if started {
            logger.warn(
                "core",
                "cloudflared process was not running; started a new tunnel process",
            );
        } else {
            logger.info("core", "cloudflared process already running; skipped restart");
        }
        Ok(())
    }

    fn wait_for_health(&self, timeout: Duration) -> Result<(), GungnrError> {
        let clock = Instant::now();
        let mut waited = Duration::ZERO;
        let mut last_failure = None;
        loop {
            match self.host.probe_health(self.health_url) {
                Ok(status) if (200..300).contains(&status) => return Ok(()),
                Ok(status) => last_failure = Some(format!("health check returned status {status}")),
                Err(err) => last_failure = Some(err.detail()),
            }
            if waited >= timeout || clock.elapsed() >= timeout {
                break;
            }
            self.host.sleep(HEALTH_POLL_INTERVAL);
            waited += HEALTH_POLL_INTERVAL;
        }
        Err(GungnrError::Phase {
            phase: "health",
            message: format!(
                "timed out waiting for API health at {} after {}s: {}",
                self.health_url,
                timeout.as_secs(),
                last_failure.unwrap_or_else(|| "no response".to_string())
            ),
        })
    }

    fn recover_managed(
        &self,
        controls: &RunControls,
        logger: &RunLogger,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), GungnrError> {
        let containers = match self.host.list_compose_containers() {
            Ok(containers) => containers,
            Err(err) => {
                let message = err.detail();
                logger.error("managed", &message);
                outcome.managed_error = Some(message.clone());
                return Err(GungnrError::Phase {
                    phase: "managed",
                    message,
                });
            }
        };

        let Some(core_project) = find_core_project(&containers) else {
            let message =
                "core compose project not detected; skipped managed project recovery".to_string();
            logger.warn("managed", &message);
            outcome.managed_error = Some(message.clone());
            return Err(GungnrError::Phase {
                phase: "managed",
                message,
            });
        };

        let projects = group_managed_projects(&containers, &core_project);
        outcome.core_project = Some(core_project);
        outcome.managed_recovery_attempted = true;
        outcome.managed_projects = projects.len();

        for (project, ids) in &projects {
            match self.start_managed_project(project, ids, controls, logger) {
                Ok(()) => outcome.managed_projects_recovered += 1,
                Err(err) => {
                    outcome.managed_projects_failed += 1;
                    outcome.failed_projects.push(project.clone());
                    outcome
                        .failed_project_errors
                        .insert(project.clone(), err.detail());
                }
            }
        }

        if outcome.managed_projects_failed > 0 {
            let message = format!(
                "{} managed project(s) failed to recover",
                outcome.managed_projects_failed
            );
            logger.error("managed", &message);
            outcome.managed_error = Some(message.clone());
            return Err(GungnrError::Phase {
                phase: "managed",
                message,
            });
        }
        Ok(())
    }

    fn start_managed_project(
        &self,
        project: &str,
        ids: &[String],
        controls: &RunControls,
        logger: &RunLogger,
    ) -> Result<(), GungnrError> {
        let attempts = controls.managed_retry_count.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            logger.info(
                "managed",
                &format!(
                    "starting project {project} (attempt {attempt}/{attempts}, timeout={})",
                    controls.managed_start_timeout_raw
                ),
            );
            match self
                .host
                .start_containers(ids, controls.managed_start_timeout())
            {
                Ok(()) => {
                    logger.info("managed", &format!("project {project} recovered"));
                    return Ok(());
                }
                Err(err) => {
                    logger.warn(
                        "managed",
                        &format!("project {project} attempt {attempt} failed: {}", err.detail()),
                    );
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
                let delay = controls.managed_backoff().saturating_mul(factor);
                self.host.sleep(if delay.is_zero() {
                    Duration::from_secs(1)
                } else {
                    delay
                });
            }
        }
        Err(last_error
            .unwrap_or_else(|| GungnrError::Process("managed recovery failed".to_string())))
    }
}

fn precondition(check: &'static str, err: GungnrError) -> GungnrError {
    GungnrError::Precondition {
        check,
        message: err.detail(),
    }
}

fn phase_error(phase: &'static str, err: GungnrError) -> GungnrError {
    GungnrError::Phase {
        phase,
        message: err.detail(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum KeepaliveState {
    Enabled,
    Partial,
    Disabled,
}

impl KeepaliveState {
    fn as_str(self) -> &'static str {
        match self {
            KeepaliveState::Enabled => "enabled",
            KeepaliveState::Partial => "partial",
            KeepaliveState::Disabled => "disabled",
        }
    }
}

pub(crate) fn keepalive_state(status: &SupervisorStatus) -> KeepaliveState {
    let scripts = status.run_script_exists && status.ensure_script_exists;
    match status.active {
        SupervisorKind::Systemd if scripts && status.systemd.timer_enabled => {
            KeepaliveState::Enabled
        }
        SupervisorKind::Cron if scripts && status.cron.has_boot && status.cron.has_watch => {
            KeepaliveState::Enabled
        }
        SupervisorKind::Systemd | SupervisorKind::Cron => KeepaliveState::Partial,
        SupervisorKind::None => {
            let any = status.run_script_exists
                || status.ensure_script_exists
                || status.systemd.service_file_exists
                || status.systemd.timer_file_exists
                || status.cron.has_boot
                || status.cron.has_watch;
            if any {
                KeepaliveState::Partial
            } else {
                KeepaliveState::Disabled
            }
        }
    }
}

const HINT_DOCKER: &str = "Docker permissions are blocking recovery. Ensure the user can access `/var/run/docker.sock` (docker group + re-login).";
const HINT_COMPOSE: &str = "Compose resolution failed. Re-run `gungnr keepalive enable` from the project root or set absolute `GUNGNR_COMPOSE_FILE` in `~/gungnr/.env`.";
const HINT_CLOUDFLARED: &str =
    "Install cloudflared and ensure it is available in PATH for non-interactive sessions.";
const HINT_SYSTEMD: &str = "Systemd user services are unavailable. Enable linger (`sudo loginctl enable-linger $USER`) or rely on cron fallback.";
const HINT_SYSTEMD_SESSION: &str = "Systemd user session is unavailable. Enable linger (`sudo loginctl enable-linger $USER`) or use cron fallback by re-running `gungnr keepalive enable`.";
const HINT_BOOTSTRAP: &str =
    "Bootstrap environment is missing. Run `gungnr bootstrap` before enabling keepalive recovery.";
const HINT_LOCK: &str = "A previous keepalive run is still in progress. Wait for completion or inspect `~/gungnr/state/keepalive.log`.";
const HINT_HEALTH: &str = "API health timed out. Inspect compose logs (`~/gungnr/state/docker-compose.log`) and service status before retrying.";
const HINT_UNREADABLE: &str =
    "Last-run metadata is unreadable. Remove and regenerate with `gungnr keepalive recover`.";

pub(crate) fn remediation_from_errors<'m, I>(messages: I) -> Vec<String>
where
    I: IntoIterator<Item = &'m str>,
{
    let mut hints = Vec::new();
    for message in messages {
        let msg = message.trim().to_lowercase();
        if msg.is_empty() {
            continue;
        }
        if msg.contains("docker access failed")
            || (msg.contains("docker") && msg.contains("permission denied"))
        {
            hints.push(HINT_DOCKER);
        }
        if msg.contains("docker compose not available")
            || msg.contains("docker-compose.yml")
            || msg.contains("compose file")
        {
            hints.push(HINT_COMPOSE);
        }
        if msg.contains("cloudflared not found") {
            hints.push(HINT_CLOUDFLARED);
        }
        if msg.contains("systemctl --user")
            || msg.contains("failed to connect")
            || msg.contains("session")
        {
            hints.push(HINT_SYSTEMD);
        }
        if msg.contains("bootstrap .env not found") {
            hints.push(HINT_BOOTSTRAP);
        }
        if msg.contains("keepalive recovery already running") {
            hints.push(HINT_LOCK);
        }
        if msg.contains("timed out") && msg.contains("health") {
            hints.push(HINT_HEALTH);
        }
    }
    unique_non_empty(hints)
}

pub(crate) fn remediation_from_status(status: &SupervisorStatus) -> Vec<String> {
    let reason = status
        .systemd
        .unavailable_reason
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let session_problem = ["failed to connect", "dbus", "no medium", "session"]
        .iter()
        .any(|needle| reason.contains(needle));
    if session_problem {
        vec![HINT_SYSTEMD_SESSION.to_string()]
    } else {
        Vec::new()
    }
}

fn run_remediation(outcome: &RecoveryOutcome) -> Vec<String> {
    let messages = [&outcome.core_error, &outcome.health_error, &outcome.managed_error]
        .into_iter()
        .flatten()
        .chain(outcome.failed_project_errors.values())
        .map(String::as_str);
    remediation_from_errors(messages)
}

fn recovery_summary_lines(run: &RecoveryRun) -> Vec<String> {
    let recovery = &run.recovery;
    let mut lines = vec![
        format!("Result: {}", run.result.as_str()),
        format!("Core recovered: {}", bool_label(recovery.core_recovered)),
        format!("Tunnel started: {}", bool_label(recovery.tunnel_started)),
        format!("API healthy: {}", bool_label(recovery.api_healthy)),
        format!(
            "Managed recovery attempted: {}",
            bool_label(recovery.managed_recovery_attempted)
        ),
        format!("Managed projects: {}", recovery.managed_projects),
        format!("Managed projects recovered: {}", recovery.managed_projects_recovered),
        format!("Managed projects failed: {}", recovery.managed_projects_failed),
        format!("Core project: {}", or_fallback(recovery.core_project.as_deref(), "n/a")),
        format!("Core error: {}", or_fallback(recovery.core_error.as_deref(), "none")),
        format!("Health error: {}", or_fallback(recovery.health_error.as_deref(), "none")),
        format!("Managed error: {}", or_fallback(recovery.managed_error.as_deref(), "none")),
    ];
    if !recovery.failed_projects.is_empty() {
        lines.push(format!("Failed projects: {}", recovery.failed_projects.join(", ")));
    }
    lines
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

struct Configured {
    setup: SetupResult,
    compose_file: PathBuf,
    tunnel: String,
}

fn configure<R: CommandRunner>(
    ctx: &KeepaliveContext,
    runner: &R,
    mode: KeepaliveMode,
    recovering_now: bool,
) -> Result<Configured, GungnrError> {
    let store = FileStateStore::new(&ctx.paths.state_dir);
    let cwd = env::current_dir()?;
    let compose_file = resolve_compose_for_setup(&ctx.env, &store, &cwd, &ctx.paths.env_file)?;
    let tunnel = read_cloudflared_config(&ctx.paths.cloudflared_config).map_err(|err| {
        GungnrError::Config(format!(
            "invalid cloudflared config {}: {}",
            ctx.paths.cloudflared_config.display(),
            err.detail()
        ))
    })?;

    let mut supervisor = Supervisor::new(runner, ctx.paths.supervisor());
    if recovering_now {
        supervisor = supervisor.without_kick_off();
    }
    let setup = supervisor.setup(&ctx.paths.cloudflared_config)?;
    store.set(StateKey::Mode, mode.as_str())?;
    store.set(StateKey::ComposeFile, &compose_file.to_string_lossy())?;
    info!(mode = mode.as_str(), supervisor = setup.supervisor.as_str(), "keepalive configured");
    Ok(Configured {
        setup,
        compose_file,
        tunnel: tunnel_label(&tunnel),
    })
}

fn configuration_lines(action: &str, mode: KeepaliveMode, configured: &Configured) -> Vec<String> {
    let mut lines = vec![
        format!("Action: {action}"),
        format!("Mode: {}", mode.as_str()),
        format!("Supervisor: {}", configured.setup.supervisor.as_str()),
        "Configured: yes".to_string(),
        format!("Detail: {}", or_fallback(Some(configured.setup.detail.as_str()), "n/a")),
        format!("Tunnel: {}", configured.tunnel),
    ];
    lines.extend(
        configured
            .setup
            .fallback_notes
            .iter()
            .map(|note| format!("Fallback: {note}")),
    );
    lines
}

pub(crate) fn handle_enable<R: CommandRunner>(
    ctx: &KeepaliveContext,
    runner: &R,
) -> Result<Report, GungnrError> {
    let mode = KeepaliveMode::Core;
    let configured = configure(ctx, runner, mode, false)?;
    let setup = &configured.setup;
    Ok(Report::new("Keepalive Enable")
        .section("Configuration", configuration_lines("enable", mode, &configured))
        .section(
            "Paths",
            vec![
                format!("Compose file: {}", configured.compose_file.display()),
                format!("Run script: {}", setup.run_script.display()),
                format!("Ensure script: {}", setup.ensure_script.display()),
                format!("Recovery log: {}", ctx.paths.log_file().display()),
                format!("Last-run metadata: {}", ctx.paths.last_run_file().display()),
            ],
        )
        .payload(json!({
            "action": "enable",
            "mode": mode,
            "compose_file": configured.compose_file,
            "setup": setup,
        })))
}

pub(crate) fn handle_all<R: CommandRunner>(
    ctx: &KeepaliveContext,
    runner: &R,
) -> Result<Report, GungnrError> {
    let mode = KeepaliveMode::All;
    let configured = configure(ctx, runner, mode, true)?;
    let host = SystemHost::new(runner, &ctx.paths)?;
    let store = FileStateStore::new(&ctx.paths.state_dir);
    let engine = RecoveryEngine::new(&host, &store, &ctx.env, &ctx.paths, &ctx.health_url);
    let (run, outcome) = engine.execute(mode, "manual-all");

    let setup = &configured.setup;
    let compose_file = run
        .recovery
        .compose_file
        .clone()
        .unwrap_or_else(|| configured.compose_file.display().to_string());
    Ok(Report::new("Keepalive All")
        .section("Configuration", configuration_lines("all", mode, &configured))
        .section("Recovery", recovery_summary_lines(&run))
        .section(
            "Paths",
            vec![
                format!("Compose file: {compose_file}"),
                format!("Run script: {}", setup.run_script.display()),
                format!("Ensure script: {}", setup.ensure_script.display()),
                format!("Log file: {}", ctx.paths.log_file().display()),
                format!("Last-run metadata: {}", ctx.paths.last_run_file().display()),
            ],
        )
        .section("Remediation", run.remediation.clone())
        .payload(json!({
            "action": "all",
            "mode": mode,
            "setup": setup,
            "run": run,
        }))
        .failure(outcome.err()))
}

pub(crate) fn handle_recover<R: CommandRunner>(
    ctx: &KeepaliveContext,
    runner: &R,
) -> Result<Report, GungnrError> {
    fs::create_dir_all(&ctx.paths.state_dir)?;
    let store = FileStateStore::new(&ctx.paths.state_dir);
    let mode = read_mode(&store).unwrap_or(KeepaliveMode::Core);
    let trigger = ctx.env.get(TRIGGER_KEY).unwrap_or("manual").to_string();
    let host = SystemHost::new(runner, &ctx.paths)?;
    let engine = RecoveryEngine::new(&host, &store, &ctx.env, &ctx.paths, &ctx.health_url);
    let (run, outcome) = engine.execute(mode, &trigger);

    let mut summary = vec![
        format!("Mode: {}", mode.as_str()),
        format!("Trigger: {trigger}"),
    ];
    summary.extend(recovery_summary_lines(&run));
    Ok(Report::new("Keepalive Recovery")
        .section("Summary", summary)
        .section(
            "Paths",
            vec![
                format!(
                    "Compose file: {}",
                    or_fallback(run.recovery.compose_file.as_deref(), "n/a")
                ),
                format!("Log file: {}", ctx.paths.log_file().display()),
                format!("Last-run metadata: {}", ctx.paths.last_run_file().display()),
            ],
        )
        .section("Remediation", run.remediation.clone())
        .payload(json!({ "run": run }))
        .failure(outcome.err()))
}

pub(crate) fn handle_disable<R: CommandRunner>(
    ctx: &KeepaliveContext,
    runner: &R,
) -> Result<Report, GungnrError> {
    let teardown = Supervisor::new(runner, ctx.paths.supervisor()).teardown()?;
    let store = FileStateStore::new(&ctx.paths.state_dir);
    let mode_removed = store.delete(StateKey::Mode)?;
    let compose_removed = store.delete(StateKey::ComposeFile)?;
    let last_run_removed = store.delete(StateKey::LastRun)?;
    let lock_removed = remove_file_if_exists(&ctx.paths.lock_file())?;

    let source = match teardown.source {
        SupervisorKind::None => SupervisorKind::Cron,
        other => other,
    };
    let mut removed: Vec<String> = teardown
        .removed
        .iter()
        .map(|artifact| format!("{}: {}", artifact.name, bool_label(artifact.removed)))
        .collect();
    removed.extend([
        format!("Mode file: {}", bool_label(mode_removed)),
        format!("Compose file pointer: {}", bool_label(compose_removed)),
        format!("Last-run metadata: {}", bool_label(last_run_removed)),
        format!("Recovery lock file: {}", bool_label(lock_removed)),
    ]);
    info!(source = source.as_str(), "keepalive disabled");

    Ok(Report::new("Keepalive Disable")
        .section(
            "Configuration",
            vec![
                "Action: disable".to_string(),
                format!("Supervisor source: {}", source.as_str()),
            ],
        )
        .section("Removed", removed)
        .payload(json!({
            "action": "disable",
            "source": source,
            "removed": teardown.removed,
            "mode_removed": mode_removed,
            "compose_pointer_removed": compose_removed,
            "last_run_removed": last_run_removed,
            "lock_removed": lock_removed,
        })))
}

pub(crate) fn handle_status<R: CommandRunner>(
    ctx: &KeepaliveContext,
    runner: &R,
) -> Result<Report, GungnrError> {
    let status = Supervisor::new(runner, ctx.paths.supervisor()).status()?;
    let state = keepalive_state(&status);
    let store = FileStateStore::new(&ctx.paths.state_dir);
    let mode = read_mode(&store).unwrap_or(KeepaliveMode::Core);
    let source = match status.source {
        SupervisorKind::None => SupervisorKind::Cron,
        other => other,
    };
    let compose_pointer = read_compose_pointer(&store);
    let compose_exists = compose_pointer
        .as_deref()
        .map(|pointer| file_exists(Path::new(pointer)))
        .unwrap_or(false);
    let tunnel = if file_exists(&ctx.paths.cloudflared_config) {
        match read_cloudflared_config(&ctx.paths.cloudflared_config) {
            Ok(config) => tunnel_label(&config),
            Err(err) => format!("unreadable ({})", err.detail()),
        }
    } else {
        "config not found".to_string()
    };

    let last_run = read_last_run(&store);
    let mut remediation = remediation_from_status(&status);
    let last_run_lines = match &last_run {
        Err(err) => {
            remediation.push(HINT_UNREADABLE.to_string());
            vec![format!("Metadata error: {}", err.detail())]
        }
        Ok(None) => vec!["No keepalive run metadata recorded yet.".to_string()],
        Ok(Some(run)) => {
            remediation.extend(run.remediation.iter().cloned());
            let mut lines = vec![
                format!("Trigger: {}", run.trigger),
                format!("Mode: {}", run.mode.as_str()),
                format!("Started: {}", timestamp(&run.started_at)),
                format!("Finished: {}", timestamp(&run.finished_at)),
                format!("Duration: {}s", run.duration_sec),
            ];
            lines.extend(recovery_summary_lines(run));
            lines
        }
    };
    let remediation = unique_non_empty(remediation);

    let configuration = vec![
        format!("Status: {}", state.as_str()),
        format!("Mode: {}", mode.as_str()),
        format!("Supervisor source: {}", source.as_str()),
        format!("Supervisor active: {}", status.active.as_str()),
        format!("Systemd available: {}", bool_label(status.systemd.available)),
        format!(
            "Systemd reason: {}",
            or_fallback(status.systemd.unavailable_reason.as_deref(), "n/a")
        ),
        format!("Cron available: {}", bool_label(status.cron.available)),
    ];
    let artifacts = vec![
        format!(
            "Run script: {} ({})",
            bool_label(status.run_script_exists),
            status.run_script.display()
        ),
        format!(
            "Ensure script: {} ({})",
            bool_label(status.ensure_script_exists),
            status.ensure_script.display()
        ),
        format!("Systemd timer file: {}", bool_label(status.systemd.timer_file_exists)),
        format!("Systemd service file: {}", bool_label(status.systemd.service_file_exists)),
        format!("Systemd timer enabled: {}", bool_label(status.systemd.timer_enabled)),
        format!("Systemd timer active: {}", bool_label(status.systemd.timer_active)),
        format!("Cron @reboot entry: {}", bool_label(status.cron.has_boot)),
        format!("Cron 5-minute entry: {}", bool_label(status.cron.has_watch)),
    ];
    let paths = vec![
        format!("Cloudflared config: {}", ctx.paths.cloudflared_config.display()),
        format!("Tunnel: {tunnel}"),
        format!("Bootstrap env: {}", ctx.paths.env_file.display()),
        format!(
            "Compose file pointer: {}",
            or_fallback(compose_pointer.as_deref(), "not set")
        ),
        format!("Compose file exists: {}", bool_label(compose_exists)),
        format!("Keepalive log: {}", ctx.paths.log_file().display()),
        format!("Last-run metadata: {}", ctx.paths.last_run_file().display()),
    ];

    let last_run_payload = match &last_run {
        Ok(run) => json!(run),
        Err(err) => json!({ "error": err.detail() }),
    };
    Ok(Report::new("Keepalive Status")
        .section("Configuration", configuration)
        .section("Artifacts", artifacts)
        .section("Paths", paths)
        .section("Last Run", last_run_lines)
        .section("Remediation", remediation.clone())
        .payload(json!({
            "status": state,
            "mode": mode,
            "source": source,
            "supervisor": status,
            "compose_file": compose_pointer,
            "compose_file_exists": compose_exists,
            "last_run": last_run_payload,
            "remediation": remediation,
        })))
}

/// In-memory store for engine tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryStateStore {
    values: RefCell<BTreeMap<StateKey, String>>,
    fail_writes: bool,
}

#[cfg(test)]
impl StateStore for MemoryStateStore {
    fn get(&self, key: StateKey) -> Result<Option<String>, GungnrError> {
        Ok(self
            .values
            .borrow()
            .get(&key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    fn set(&self, key: StateKey, value: &str) -> Result<(), GungnrError> {
        if self.fail_writes {
            return Err(GungnrError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "read-only state directory",
            )));
        }
        self.values.borrow_mut().insert(key, value.to_string());
        Ok(())
    }

    fn delete(&self, key: StateKey) -> Result<bool, GungnrError> {
        Ok(self.values.borrow_mut().remove(&key).is_some())
    }
}

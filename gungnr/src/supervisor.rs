use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::{
    file_exists, remove_file_if_exists, shell_single_quote, write_atomic_text_file, GungnrError,
};

pub(crate) const RUN_SCRIPT_NAME: &str = "cloudflared-run.sh";
pub(crate) const ENSURE_SCRIPT_NAME: &str = "cloudflared-ensure.sh";
pub(crate) const KEEPALIVE_LOG_NAME: &str = "keepalive.log";
pub(crate) const LOCK_FILE_NAME: &str = "keepalive.lock";

pub(crate) const SYSTEMD_SERVICE_UNIT: &str = "gungnr-cloudflared-keepalive.service";
pub(crate) const SYSTEMD_TIMER_UNIT: &str = "gungnr-cloudflared-keepalive.timer";

pub(crate) const CRON_MARKER_BOOT: &str = "gungnr-cloudflared";
pub(crate) const CRON_MARKER_WATCH: &str = "gungnr-cloudflared-watch";

// systemctl and crontab messages are classified by their English text.
const MESSAGE_LOCALE: &str = "C";

const SCRIPT_MODE: u32 = 0o755;
const UNIT_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SupervisorKind {
    Systemd,
    Cron,
    None,
}

impl SupervisorKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SupervisorKind::Systemd => "systemd",
            SupervisorKind::Cron => "cron",
            SupervisorKind::None => "none",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SupervisorPaths {
    pub(crate) state_dir: PathBuf,
    pub(crate) unit_dir: PathBuf,
}

impl SupervisorPaths {
    pub(crate) fn run_script(&self) -> PathBuf {
        self.state_dir.join(RUN_SCRIPT_NAME)
    }

    pub(crate) fn ensure_script(&self) -> PathBuf {
        self.state_dir.join(ENSURE_SCRIPT_NAME)
    }

    pub(crate) fn log_file(&self) -> PathBuf {
        self.state_dir.join(KEEPALIVE_LOG_NAME)
    }

    pub(crate) fn lock_file(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Availability {
    pub(crate) available: bool,
    pub(crate) reason: Option<String>,
}

impl Availability {
    fn yes() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    fn no(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct RemovedArtifact {
    pub(crate) name: String,
    pub(crate) removed: bool,
}

impl RemovedArtifact {
    fn new(name: &str, removed: bool) -> Self {
        Self {
            name: name.to_string(),
            removed,
        }
    }
}

/// One periodic-trigger mechanism. Setup walks an ordered list of these.
pub(crate) trait SupervisorBackend {
    fn kind(&self) -> SupervisorKind;

    fn probe(&self) -> Availability;

    /// Installs the trigger for `ensure_script` and returns a one-line detail.
    fn install(&self, ensure_script: &Path) -> Result<String, GungnrError>;

    /// Removes this backend's managed artifacts. Absent artifacts are not an error.
    fn teardown(&self) -> Result<Vec<RemovedArtifact>, GungnrError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct SystemdStatus {
    pub(crate) available: bool,
    pub(crate) unavailable_reason: Option<String>,
    pub(crate) service_path: PathBuf,
    pub(crate) timer_path: PathBuf,
    pub(crate) service_file_exists: bool,
    pub(crate) timer_file_exists: bool,
    pub(crate) timer_enabled: bool,
    pub(crate) timer_active: bool,
}

impl SystemdStatus {
    fn is_active(&self) -> bool {
        self.timer_enabled || self.timer_active
    }

    fn has_artifacts(&self) -> bool {
        self.service_file_exists || self.timer_file_exists
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct CronStatus {
    pub(crate) available: bool,
    pub(crate) has_boot: bool,
    pub(crate) has_watch: bool,
}

impl CronStatus {
    fn is_configured(&self) -> bool {
        self.has_boot || self.has_watch
    }
}

pub(crate) struct SystemdBackend<'a, R: CommandRunner> {
    runner: &'a R,
    unit_dir: PathBuf,
    linux: bool,
    kick_off: bool,
}

impl<'a, R: CommandRunner> SystemdBackend<'a, R> {
    fn service_path(&self) -> PathBuf {
        self.unit_dir.join(SYSTEMD_SERVICE_UNIT)
    }

    fn timer_path(&self) -> PathBuf {
        self.unit_dir.join(SYSTEMD_TIMER_UNIT)
    }

    fn query(&self, args: &[&str]) -> Option<CommandOutput> {
        let spec = systemctl_spec(args);
        self.runner.run(&spec).ok()
    }

    fn systemctl(&self, args: &[&str]) -> Result<String, String> {
        let rendered = args.join(" ");
        let spec = systemctl_spec(args);
        let output = self
            .runner
            .run(&spec)
            .map_err(|err| format!("systemctl --user {rendered} failed: {err}"))?;
        let text = output.combined_text();
        if output.success() {
            return Ok(text);
        }
        if text.is_empty() {
            return Err(format!(
                "systemctl --user {rendered} failed with status {}",
                output.status_code
            ));
        }
        Err(format!("systemctl --user {rendered} failed: {text}"))
    }

    fn best_effort(&self, args: &[&str]) {
        if let Err(err) = self.systemctl(args) {
            debug!(error = %err, "ignoring systemctl failure during teardown");
        }
    }

    pub(crate) fn status(&self) -> SystemdStatus {
        let availability = self.probe();
        let service_path = self.service_path();
        let timer_path = self.timer_path();
        let mut status = SystemdStatus {
            available: availability.available,
            unavailable_reason: availability.reason,
            service_file_exists: file_exists(&service_path),
            timer_file_exists: file_exists(&timer_path),
            service_path,
            timer_path,
            ..SystemdStatus::default()
        };
        if !status.available {
            return status;
        }
        status.timer_enabled = self
            .query(&["is-enabled", SYSTEMD_TIMER_UNIT])
            .and_then(|out| timer_enabled_state(out.success(), &out.combined_text()))
            .unwrap_or(false);
        status.timer_active = self
            .query(&["is-active", SYSTEMD_TIMER_UNIT])
            .and_then(|out| timer_active_state(out.success(), &out.combined_text()))
            .unwrap_or(false);
        status
    }
}

impl<'a, R: CommandRunner> SupervisorBackend for SystemdBackend<'a, R> {
    fn kind(&self) -> SupervisorKind {
        SupervisorKind::Systemd
    }

    fn probe(&self) -> Availability {
        if !self.linux {
            return Availability::no("non-linux host");
        }
        if self.runner.locate("systemctl").is_none() {
            return Availability::no("systemctl not found in PATH");
        }
        match self.systemctl(&["show-environment"]) {
            Ok(_) => Availability::yes(),
            Err(reason) => Availability::no(reason),
        }
    }

    fn install(&self, ensure_script: &Path) -> Result<String, GungnrError> {
        fs::create_dir_all(&self.unit_dir)?;
        write_atomic_text_file(
            &self.service_path(),
            &systemd_service_unit(ensure_script),
            Some(UNIT_MODE),
        )?;
        write_atomic_text_file(&self.timer_path(), &systemd_timer_unit(), Some(UNIT_MODE))?;

        let mut steps: Vec<&[&str]> = Vec::with_capacity(3);
        steps.push(&["daemon-reload"]);
        steps.push(&["enable", "--now", SYSTEMD_TIMER_UNIT]);
        // The service runs the whole recovery, so the kick-off start must not wait for it.
        if self.kick_off {
            steps.push(&["start", "--no-block", SYSTEMD_SERVICE_UNIT]);
        }
        for args in steps {
            self.systemctl(args).map_err(GungnrError::Process)?;
        }
        Ok("installed user systemd timer for keepalive recovery watchdog".to_string())
    }

    fn teardown(&self) -> Result<Vec<RemovedArtifact>, GungnrError> {
        let available = self.probe().available;
        if available {
            self.best_effort(&["disable", "--now", SYSTEMD_TIMER_UNIT]);
            self.best_effort(&["stop", SYSTEMD_SERVICE_UNIT]);
        }
        let timer_removed = remove_file_if_exists(&self.timer_path())?;
        let service_removed = remove_file_if_exists(&self.service_path())?;
        if available && (timer_removed || service_removed) {
            self.best_effort(&["daemon-reload"]);
        }
        Ok(vec![
            RemovedArtifact::new("Systemd timer", timer_removed),
            RemovedArtifact::new("Systemd service", service_removed),
        ])
    }
}

pub(crate) struct CronBackend<'a, R: CommandRunner> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> CronBackend<'a, R> {
    /// `Ok(None)` means the current user may not use crontab.
    fn read_crontab(&self) -> Result<Option<String>, GungnrError> {
        let output = self
            .runner
            .run(&crontab_spec("-l"))
            .map_err(|err| GungnrError::Process(format!("read crontab: {err}")))?;
        classify_crontab_listing(&output).map_err(GungnrError::Process)
    }

    fn write_crontab(&self, content: &str, action: &str) -> Result<(), GungnrError> {
        let spec = crontab_spec("-").stdin(content);
        let output = self
            .runner
            .run(&spec)
            .map_err(|err| GungnrError::Process(format!("{action}: {err}")))?;
        if !output.success() {
            return Err(GungnrError::Process(format!(
                "{action}: {}",
                output.combined_text()
            )));
        }
        Ok(())
    }

    pub(crate) fn status(&self) -> Result<CronStatus, GungnrError> {
        if self.runner.locate("crontab").is_none() {
            return Ok(CronStatus::default());
        }
        let Some(content) = self.read_crontab()? else {
            return Ok(CronStatus::default());
        };
        Ok(CronStatus {
            available: true,
            has_boot: content.lines().any(|line| has_cron_marker(line, CRON_MARKER_BOOT)),
            has_watch: content.lines().any(|line| has_cron_marker(line, CRON_MARKER_WATCH)),
        })
    }
}

impl<'a, R: CommandRunner> SupervisorBackend for CronBackend<'a, R> {
    fn kind(&self) -> SupervisorKind {
        SupervisorKind::Cron
    }

    fn probe(&self) -> Availability {
        if self.runner.locate("crontab").is_none() {
            return Availability::no("crontab not found in PATH");
        }
        match self.read_crontab() {
            Ok(Some(_)) => Availability::yes(),
            Ok(None) => Availability::no("crontab is unavailable for the current user"),
            Err(err) => Availability::no(err.to_string()),
        }
    }

    fn install(&self, ensure_script: &Path) -> Result<String, GungnrError> {
        if self.runner.locate("crontab").is_none() {
            return Err(GungnrError::Process(
                "crontab command not found; unable to configure cron fallback".to_string(),
            ));
        }
        let existing = self.read_crontab()?.ok_or_else(|| {
            GungnrError::Process("crontab is unavailable for the current user".to_string())
        })?;
        let mut content = strip_managed_cron_lines(&existing);
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&cron_lines(ensure_script));
        self.write_crontab(&content, "install crontab entries")?;
        Ok("installed @reboot and 5-minute keepalive recovery watchdog via crontab".to_string())
    }

    fn teardown(&self) -> Result<Vec<RemovedArtifact>, GungnrError> {
        let unchanged = vec![RemovedArtifact::new("Crontab entries", false)];
        if self.runner.locate("crontab").is_none() {
            return Ok(unchanged);
        }
        let Some(existing) = self.read_crontab()? else {
            return Ok(unchanged);
        };
        let managed = existing.lines().any(|line| {
            has_cron_marker(line, CRON_MARKER_BOOT) || has_cron_marker(line, CRON_MARKER_WATCH)
        });
        if !managed {
            return Ok(unchanged);
        }
        self.write_crontab(&strip_managed_cron_lines(&existing), "update crontab entries")?;
        Ok(vec![RemovedArtifact::new("Crontab entries", true)])
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SetupResult {
    pub(crate) supervisor: SupervisorKind,
    pub(crate) run_script: PathBuf,
    pub(crate) ensure_script: PathBuf,
    pub(crate) detail: String,
    pub(crate) fallback_notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TeardownResult {
    pub(crate) source: SupervisorKind,
    pub(crate) removed: Vec<RemovedArtifact>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SupervisorStatus {
    pub(crate) source: SupervisorKind,
    pub(crate) active: SupervisorKind,
    pub(crate) run_script: PathBuf,
    pub(crate) ensure_script: PathBuf,
    pub(crate) run_script_exists: bool,
    pub(crate) ensure_script_exists: bool,
    pub(crate) systemd: SystemdStatus,
    pub(crate) cron: CronStatus,
}

pub(crate) struct Supervisor<'a, R: CommandRunner> {
    runner: &'a R,
    paths: SupervisorPaths,
    linux: bool,
    kick_off: bool,
}

impl<'a, R: CommandRunner> Supervisor<'a, R> {
    pub(crate) fn new(runner: &'a R, paths: SupervisorPaths) -> Self {
        Self {
            runner,
            paths,
            linux: cfg!(target_os = "linux"),
            kick_off: true,
        }
    }

    /// Skips the immediate systemd service start for callers that run a recovery
    /// themselves right after setup.
    pub(crate) fn without_kick_off(mut self) -> Self {
        self.kick_off = false;
        self
    }

    #[cfg(test)]
    fn on_linux(mut self, linux: bool) -> Self {
        self.linux = linux;
        self
    }

    fn systemd(&self) -> SystemdBackend<'a, R> {
        SystemdBackend {
            runner: self.runner,
            unit_dir: self.paths.unit_dir.clone(),
            linux: self.linux,
            kick_off: self.kick_off,
        }
    }

    fn cron(&self) -> CronBackend<'a, R> {
        CronBackend {
            runner: self.runner,
        }
    }

    pub(crate) fn setup(&self, config_path: &Path) -> Result<SetupResult, GungnrError> {
        let meta = fs::metadata(config_path).map_err(|err| GungnrError::Precondition {
            check: "cloudflared config",
            message: format!("cloudflared config not found at {}: {err}", config_path.display()),
        })?;
        if meta.is_dir() {
            return Err(GungnrError::Precondition {
                check: "cloudflared config",
                message: format!(
                    "cloudflared config path {} is a directory",
                    config_path.display()
                ),
            });
        }
        fs::create_dir_all(&self.paths.state_dir)?;

        let executable = resolve_keepalive_executable(self.runner)?;
        let run_script = self.paths.run_script();
        let ensure_script = self.paths.ensure_script();
        write_atomic_text_file(
            &run_script,
            &run_script_content(&executable, &self.paths.log_file()),
            Some(SCRIPT_MODE),
        )?;
        write_atomic_text_file(
            &ensure_script,
            &ensure_script_content(&run_script, &self.paths.lock_file()),
            Some(SCRIPT_MODE),
        )?;

        let systemd = self.systemd();
        let cron = self.cron();
        let strategies: [&dyn SupervisorBackend; 2] = [&systemd, &cron];
        let mut fallback_notes = Vec::new();
        for (index, backend) in strategies.iter().enumerate() {
            let last = index + 1 == strategies.len();
            let kind = backend.kind().as_str();
            if !last {
                let availability = backend.probe();
                if !availability.available {
                    let reason = availability.reason.unwrap_or_default();
                    debug!(backend = kind, reason = %reason, "supervisor backend unavailable");
                    fallback_notes.push(format!("{kind} unavailable: {reason}"));
                    continue;
                }
            }
            match backend.install(&ensure_script) {
                Ok(detail) => {
                    for other in strategies.iter().filter(|other| other.kind() != backend.kind()) {
                        if let Err(err) = other.teardown() {
                            warn!(
                                backend = other.kind().as_str(),
                                error = %err,
                                "failed to remove inactive supervisor artifacts"
                            );
                        }
                    }
                    info!(backend = kind, "keepalive supervisor installed");
                    return Ok(SetupResult {
                        supervisor: backend.kind(),
                        run_script,
                        ensure_script,
                        detail,
                        fallback_notes,
                    });
                }
                Err(err) if !last => {
                    warn!(backend = kind, error = %err, "supervisor install failed; falling back");
                    fallback_notes.push(format!("{kind} install failed: {err}"));
                    if let Err(teardown_err) = backend.teardown() {
                        warn!(
                            backend = kind,
                            error = %teardown_err,
                            "rollback of failed install was incomplete"
                        );
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(GungnrError::Process(
            "no keepalive supervisor backend could be installed".to_string(),
        ))
    }

    pub(crate) fn teardown(&self) -> Result<TeardownResult, GungnrError> {
        let source = self
            .status()
            .map(|status| status.source)
            .unwrap_or(SupervisorKind::Cron);

        let mut removed = vec![
            RemovedArtifact::new("Run script", remove_file_if_exists(&self.paths.run_script())?),
            RemovedArtifact::new(
                "Ensure script",
                remove_file_if_exists(&self.paths.ensure_script())?,
            ),
        ];
        removed.extend(self.systemd().teardown()?);
        removed.extend(self.cron().teardown()?);
        Ok(TeardownResult { source, removed })
    }

    pub(crate) fn status(&self) -> Result<SupervisorStatus, GungnrError> {
        let run_script = self.paths.run_script();
        let ensure_script = self.paths.ensure_script();
        let systemd = self.systemd().status();
        let cron = self.cron().status()?;
        let source = if systemd.available {
            SupervisorKind::Systemd
        } else {
            SupervisorKind::Cron
        };
        Ok(SupervisorStatus {
            source,
            active: active_backend(&systemd, &cron),
            run_script_exists: file_exists(&run_script),
            ensure_script_exists: file_exists(&ensure_script),
            run_script,
            ensure_script,
            systemd,
            cron,
        })
    }
}

pub(crate) fn active_backend(systemd: &SystemdStatus, cron: &CronStatus) -> SupervisorKind {
    if systemd.is_active() {
        SupervisorKind::Systemd
    } else if cron.is_configured() {
        SupervisorKind::Cron
    } else if systemd.has_artifacts() {
        SupervisorKind::Systemd
    } else {
        SupervisorKind::None
    }
}

/// Absolute path of the `gungnr` binary the generated scripts should call.
pub(crate) fn resolve_keepalive_executable<R: CommandRunner + ?Sized>(
    runner: &R,
) -> Result<PathBuf, GungnrError> {
    if let Some(path) = runner.locate("gungnr") {
        if path.is_absolute() {
            return Ok(path);
        }
        return Ok(env::current_dir()?.join(path));
    }
    let executable = env::current_exe().map_err(|_| {
        GungnrError::NotInstalled(
            "unable to resolve gungnr executable path from PATH; install gungnr to enable keepalive"
                .to_string(),
        )
    })?;
    if is_build_artifact(&executable) {
        return Err(GungnrError::NotInstalled(format!(
            "keepalive requires an installed gungnr binary in PATH (not a cargo build artifact at {})",
            executable.display()
        )));
    }
    Ok(executable)
}

fn is_build_artifact(path: &Path) -> bool {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    parts
        .windows(2)
        .any(|pair| pair[0] == "target" && matches!(pair[1], "debug" | "release"))
}

fn run_script_content(executable: &Path, log_path: &Path) -> String {
    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail

KEEPALIVE_EXECUTABLE={exe}
LOG_PATH={log}

if [[ ! -x "$KEEPALIVE_EXECUTABLE" ]]; then
  echo "keepalive executable not found at $KEEPALIVE_EXECUTABLE" >>"$LOG_PATH"
  exit 1
fi

export GUNGNR_KEEPALIVE_TRIGGER=supervisor
exec "$KEEPALIVE_EXECUTABLE" keepalive recover >>"$LOG_PATH" 2>&1
"#,
        exe = shell_single_quote(&executable.to_string_lossy()),
        log = shell_single_quote(&log_path.to_string_lossy()),
    )
}

fn ensure_script_content(run_script: &Path, lock_path: &Path) -> String {
    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail

RUN_SCRIPT={run}
LOCK_PATH={lock}
TIMER_UNIT={timer}

# A recovery run holds the lock for its whole duration.
if command -v flock >/dev/null 2>&1 && [[ -e "$LOCK_PATH" ]]; then
  if ! flock -n "$LOCK_PATH" true; then
    exit 0
  fi
fi

if [[ "${{GUNGNR_KEEPALIVE_SUPERVISOR:-}}" == "systemd" ]]; then
  exec "$RUN_SCRIPT"
fi

if command -v systemctl >/dev/null 2>&1 && systemctl --user is-active --quiet "$TIMER_UNIT" 2>/dev/null; then
  exit 0
fi

nohup "$RUN_SCRIPT" >/dev/null 2>&1 &
"#,
        run = shell_single_quote(&run_script.to_string_lossy()),
        lock = shell_single_quote(&lock_path.to_string_lossy()),
        timer = SYSTEMD_TIMER_UNIT,
    )
}

fn systemd_quote(path: &Path) -> String {
    let escaped = path
        .to_string_lossy()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("\"{escaped}\"")
}

fn systemd_service_unit(ensure_script: &Path) -> String {
    format!(
        "[Unit]
Description=Gungnr keepalive recovery check
Wants=network-online.target
After=network-online.target

[Service]
Type=oneshot
Environment=GUNGNR_KEEPALIVE_SUPERVISOR=systemd
ExecStart=/usr/bin/env bash -l {}
KillMode=process
",
        systemd_quote(ensure_script)
    )
}

fn systemd_timer_unit() -> String {
    format!(
        "[Unit]
Description=Gungnr keepalive recovery timer

[Timer]
OnBootSec=1min
OnUnitActiveSec=5min
Unit={SYSTEMD_SERVICE_UNIT}
Persistent=true

[Install]
WantedBy=timers.target
"
    )
}

fn cron_lines(ensure_script: &Path) -> String {
    let quoted = shell_single_quote(&ensure_script.to_string_lossy());
    format!(
        "@reboot {quoted} # {CRON_MARKER_BOOT}\n*/5 * * * * {quoted} # {CRON_MARKER_WATCH}\n"
    )
}

fn systemctl_spec(args: &[&str]) -> CommandSpec {
    CommandSpec::new("systemctl")
        .arg("--user")
        .args(args.iter().copied())
        .env("LC_ALL", MESSAGE_LOCALE)
}

fn crontab_spec(arg: &str) -> CommandSpec {
    CommandSpec::new("crontab")
        .arg(arg)
        .env("LC_ALL", MESSAGE_LOCALE)
}

fn has_cron_marker(line: &str, marker: &str) -> bool {
    line.trim_end().ends_with(&format!("# {marker}"))
}

/// Drops every line tagged with a keepalive marker and keeps everything else,
/// blank lines included.
pub(crate) fn strip_managed_cron_lines(existing: &str) -> String {
    if existing.trim().is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(existing.len());
    for line in existing.lines() {
        if has_cron_marker(line, CRON_MARKER_BOOT) || has_cron_marker(line, CRON_MARKER_WATCH) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn classify_crontab_listing(output: &CommandOutput) -> Result<Option<String>, String> {
    if output.success() {
        return Ok(Some(output.stdout_text()));
    }
    let text = output.combined_text();
    let message = text.to_lowercase();
    if message.contains("no crontab") {
        return Ok(Some(String::new()));
    }
    if message.contains("permission denied")
        || message.contains("not allowed")
        || message.contains("pam configuration")
    {
        return Ok(None);
    }
    Err(format!("read crontab: {text}"))
}

fn timer_enabled_state(success: bool, text: &str) -> Option<bool> {
    let state = text.trim().to_lowercase();
    if success {
        return Some(matches!(state.as_str(), "enabled" | "enabled-runtime"));
    }
    match state.as_str() {
        "disabled" | "static" | "indirect" | "generated" | "transient" | "masked" => Some(false),
        _ if state.contains("not-found") || state.contains("no such file") => Some(false),
        _ => None,
    }
}

fn timer_active_state(success: bool, text: &str) -> Option<bool> {
    let state = text.trim().to_lowercase();
    if success {
        return Some(state == "active");
    }
    match state.as_str() {
        "inactive" | "failed" | "deactivating" | "activating" | "unknown" => Some(false),
        _ if state.contains("could not be found") || state.contains("not loaded") => Some(false),
        _ => None,
    }
}

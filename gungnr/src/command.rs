use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::GungnrError;

const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A single external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandSpec {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) stdin: Option<String>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub(crate) fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            timeout: None,
            env: BTreeMap::new(),
        }
    }

    pub(crate) fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub(crate) fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub(crate) fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub(crate) fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = Some(timeout);
        }
        self
    }

    pub(crate) fn render(&self) -> String {
        fn shell_quote(part: &str) -> String {
            if part.is_empty() {
                return "\"\"".to_string();
            }
            if part.chars().any(|c| c.is_whitespace()) {
                return format!("\"{}\"", part.replace('"', "\\\""));
            }
            part.to_string()
        }
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOutput {
    pub(crate) status_code: i32,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) timed_out: bool,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.status_code == 0 && !self.timed_out
    }

    pub(crate) fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Trimmed stdout followed by trimmed stderr, the way a terminal would show them.
    pub(crate) fn combined_text(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        [stdout.trim(), stderr.trim()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Boundary for every external executable the keepalive supervisor touches.
pub(crate) trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error>;

    /// Starts a process that outlives this one, appending its output to `log_path`.
    fn spawn_detached(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32, io::Error>;

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

pub(crate) struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(command = %spec.render(), "running command");
        let mut child = cmd.spawn()?;
        if let Some(input) = &spec.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())?;
            }
        }

        let stdout_reader = drain_pipe(child.stdout.take());
        let stderr_reader = drain_pipe(child.stderr.take());
        let (status_code, timed_out) = wait_with_deadline(&mut child, spec.timeout)?;

        Ok(CommandOutput {
            status_code,
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
            timed_out,
        })
    }

    fn spawn_detached(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32, io::Error> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(command = %spec.render(), log = %log_path.display(), "spawning detached process");
        let child = cmd.spawn()?;
        Ok(child.id())
    }
}

fn drain_pipe<P: Read + Send + 'static>(pipe: Option<P>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or(if status.success() { 0 } else { 1 })
}

/// A timeout too large to express as an `Instant` is treated as no deadline.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<(i32, bool), io::Error> {
    let Some(deadline) = timeout.and_then(|timeout| Instant::now().checked_add(timeout)) else {
        let status = child.wait()?;
        return Ok((exit_code(status), false));
    };
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((exit_code(status), false));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok((-1, true));
        }
        thread::sleep(TIMEOUT_POLL_INTERVAL);
    }
}

/// Runs `spec` and turns spawn failures, timeouts and non-zero exits into errors.
pub(crate) fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    spec: &CommandSpec,
) -> Result<CommandOutput, GungnrError> {
    let command = spec.render();
    let output = runner.run(spec).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            GungnrError::Process(format!("{} not found in PATH", spec.program))
        } else {
            GungnrError::Process(format!("failed to run command `{command}`: {err}"))
        }
    })?;
    if output.timed_out {
        let secs = spec.timeout.map(|t| t.as_secs()).unwrap_or_default();
        return Err(GungnrError::Process(format!(
            "command `{command}` timed out after {secs}s"
        )));
    }
    if !output.success() {
        let detail = output.combined_text();
        let mut message = format!(
            "command failed with status {} while running `{}`",
            output.status_code, command
        );
        if !detail.is_empty() {
            message = format!("{message}: {detail}");
        }
        return Err(GungnrError::Process(message));
    }
    Ok(output)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Scripted runner: responses are matched by rendered-command prefix. The last
    /// queued response for a prefix is sticky. `crontab` is emulated in memory.
    #[derive(Default)]
    pub(crate) struct MockRunner {
        calls: RefCell<Vec<CommandSpec>>,
        spawned: RefCell<Vec<CommandSpec>>,
        rules: RefCell<Vec<(String, VecDeque<CommandOutput>)>>,
        programs: RefCell<BTreeMap<String, PathBuf>>,
        crontab: RefCell<Option<String>>,
        crontab_denied: RefCell<bool>,
    }

    impl MockRunner {
        pub(crate) fn with_programs(programs: &[&str]) -> Self {
            let runner = Self::default();
            for program in programs {
                runner.install(program);
            }
            runner
        }

        pub(crate) fn install(&self, program: &str) {
            self.programs
                .borrow_mut()
                .insert(program.to_string(), PathBuf::from("/usr/local/bin").join(program));
        }

        pub(crate) fn respond(&self, prefix: &str, status_code: i32, text: &str) {
            let output = CommandOutput {
                status_code,
                stdout: text.as_bytes().to_vec(),
                stderr: Vec::new(),
                timed_out: false,
            };
            let mut rules = self.rules.borrow_mut();
            if let Some((_, queue)) = rules.iter_mut().find(|(p, _)| p == prefix) {
                queue.push_back(output);
                return;
            }
            rules.push((prefix.to_string(), VecDeque::from([output])));
        }

        pub(crate) fn set_crontab(&self, content: Option<&str>) {
            *self.crontab.borrow_mut() = content.map(ToString::to_string);
        }

        pub(crate) fn deny_crontab(&self) {
            *self.crontab_denied.borrow_mut() = true;
        }

        pub(crate) fn crontab(&self) -> Option<String> {
            self.crontab.borrow().clone()
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.borrow().iter().map(CommandSpec::render).collect()
        }

        pub(crate) fn specs(&self) -> Vec<CommandSpec> {
            self.calls.borrow().clone()
        }

        pub(crate) fn spawned(&self) -> Vec<String> {
            self.spawned.borrow().iter().map(CommandSpec::render).collect()
        }

        fn emulate_crontab(&self, spec: &CommandSpec) -> CommandOutput {
            if *self.crontab_denied.borrow() {
                return CommandOutput {
                    status_code: 1,
                    stderr: b"You (tester) are not allowed to use this program (crontab)".to_vec(),
                    ..CommandOutput::default()
                };
            }
            match spec.args.first().map(String::as_str) {
                Some("-l") => match self.crontab.borrow().as_ref() {
                    Some(content) => CommandOutput {
                        stdout: content.as_bytes().to_vec(),
                        ..CommandOutput::default()
                    },
                    None => CommandOutput {
                        status_code: 1,
                        stderr: b"no crontab for tester".to_vec(),
                        ..CommandOutput::default()
                    },
                },
                _ => {
                    *self.crontab.borrow_mut() = Some(spec.stdin.clone().unwrap_or_default());
                    CommandOutput::default()
                }
            }
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
            self.calls.borrow_mut().push(spec.clone());
            if !self.programs.borrow().contains_key(&spec.program) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "not installed"));
            }
            if spec.program == "crontab" {
                return Ok(self.emulate_crontab(spec));
            }
            let rendered = spec.render();
            let mut rules = self.rules.borrow_mut();
            let matched = rules
                .iter_mut()
                .filter(|(prefix, _)| rendered.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            let Some((_, queue)) = matched else {
                return Ok(CommandOutput::default());
            };
            if queue.len() > 1 {
                return Ok(queue.pop_front().unwrap_or_default());
            }
            Ok(queue.front().cloned().unwrap_or_default())
        }

        fn spawn_detached(&self, spec: &CommandSpec, _log_path: &Path) -> Result<u32, io::Error> {
            self.spawned.borrow_mut().push(spec.clone());
            Ok(4242)
        }

        fn locate(&self, program: &str) -> Option<PathBuf> {
            self.programs.borrow().get(program).cloned()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn render_quotes_arguments_with_whitespace() {
        let spec = CommandSpec::new("docker")
            .args(["compose", "-f"])
            .arg("/srv/my stack/docker-compose.yml")
            .arg("");
        assert_eq!(
            spec.render(),
            "docker compose -f \"/srv/my stack/docker-compose.yml\" \"\""
        );
    }

    #[test]
    fn system_runner_captures_output_and_stdin() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "cat; echo oops >&2; exit 3"])
            .stdin("piped input\n");
        let output = SystemRunner.run(&spec).unwrap();
        assert_eq!(output.status_code, 3);
        assert_eq!(output.stdout_text(), "piped input\n");
        assert_eq!(output.combined_text(), "piped input\noops");
        assert!(!output.success());
    }

    #[test]
    fn system_runner_kills_process_after_timeout() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200));
        let started = Instant::now();
        let output = SystemRunner.run(&spec).unwrap();
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));

        let err = run_checked(&SystemRunner, &spec).expect_err("timeout should fail");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn system_runner_treats_unrepresentable_timeout_as_unbounded() {
        let spec = CommandSpec::new("true").timeout(Duration::MAX);
        let output = SystemRunner.run(&spec).unwrap();
        assert!(output.success());
        assert!(!output.timed_out);

        let spec = CommandSpec::new("true").timeout(Duration::from_secs(i64::MAX as u64));
        assert!(run_checked(&SystemRunner, &spec).is_ok());
    }

    #[test]
    fn system_runner_applies_environment_overrides() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "printf '%s' \"$LC_ALL\""])
            .env("LC_ALL", "C");
        let output = SystemRunner.run(&spec).unwrap();
        assert_eq!(output.stdout_text(), "C");

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("env.log");
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"mode=$GUNGNR_KEEPALIVE_TRIGGER\""])
            .env("GUNGNR_KEEPALIVE_TRIGGER", "supervisor");
        SystemRunner.spawn_detached(&spec, &log).unwrap();
        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&log).unwrap_or_default();
            if content.contains("mode=") {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(content.trim(), "mode=supervisor");
    }

    #[test]
    fn run_checked_reports_missing_program() {
        let spec = CommandSpec::new("gungnr-definitely-missing-binary");
        let err = run_checked(&SystemRunner, &spec).expect_err("missing program");
        assert_eq!(
            err.to_string(),
            "process error: gungnr-definitely-missing-binary not found in PATH"
        );
    }

    #[test]
    fn run_checked_includes_output_on_failure() {
        let spec = CommandSpec::new("sh").args(["-c", "echo denied >&2; exit 1"]);
        let err = run_checked(&SystemRunner, &spec).expect_err("non-zero exit");
        let message = err.to_string();
        assert!(message.contains("status 1"));
        assert!(message.contains("denied"));
    }

    #[test]
    fn detached_process_appends_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.log");
        std::fs::write(&log, "previous\n").unwrap();
        let spec = CommandSpec::new("sh").args(["-c", "echo started"]);
        let pid = SystemRunner.spawn_detached(&spec, &log).unwrap();
        assert!(pid > 0);
        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&log).unwrap();
            if content.contains("started") {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(content.starts_with("previous\n"));
        assert!(content.contains("started"));
    }
}

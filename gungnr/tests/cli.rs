#![cfg(unix)]

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::{tempdir, TempDir};

fn gungnr_binary() -> PathBuf {
    PathBuf::from(assert_cmd::cargo::cargo_bin!("gungnr"))
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Serves `200 ok` to every request until the test process exits.
fn spawn_health_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
            );
        }
    });
    format!("http://{addr}/healthz")
}

struct Sandbox {
    _dir: TempDir,
    home: PathBuf,
    data_dir: PathBuf,
    bin_dir: PathBuf,
    repo: PathBuf,
    calls: PathBuf,
    crontab: PathBuf,
    docker_ps: PathBuf,
    health_url: String,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let home = root.join("home");
        let data_dir = home.join("gungnr");
        let cloudflared_dir = home.join(".cloudflared");
        let bin_dir = root.join("bin");
        let repo = root.join("repo");
        for path in [&data_dir, &cloudflared_dir, &bin_dir, &repo, &home.join(".config")] {
            fs::create_dir_all(path).unwrap();
        }
        fs::write(
            data_dir.join(".env"),
            format!(
                "DOMAIN=example.com\nCLOUDFLARED_DIR={}\n",
                cloudflared_dir.display()
            ),
        )
        .unwrap();
        fs::write(
            cloudflared_dir.join("config.yml"),
            "tunnel: panel-tunnel\ncredentials-file: /etc/cloudflared/panel.json\n",
        )
        .unwrap();
        fs::write(repo.join("docker-compose.yml"), "services: {}\n").unwrap();

        let sandbox = Self {
            calls: root.join("calls.log"),
            crontab: root.join("crontab.txt"),
            docker_ps: root.join("docker-ps.jsonl"),
            health_url: spawn_health_server(),
            _dir: dir,
            home,
            data_dir,
            bin_dir,
            repo,
        };
        fs::write(&sandbox.docker_ps, "").unwrap();
        sandbox.install_stubs();
        sandbox
    }

    fn install_stubs(&self) {
        let calls = self.calls.display();
        let tunnel_marker = self.bin_dir.join("tunnel.running");
        let marker = tunnel_marker.display();
        write_executable(
            &self.bin_dir.join("docker"),
            &format!(
                r#"#!/bin/sh
echo "docker $*" >> '{calls}'
case "$1" in
  info) exit 0 ;;
  compose)
    if [ "$2" = "version" ]; then echo "Docker Compose version v2.27.0"; exit 0; fi
    echo "Container panel-api-1  Started"
    exit 0 ;;
  ps) cat '{ps}'; exit 0 ;;
  start) shift; for id in "$@"; do echo "$id"; done; exit 0 ;;
esac
exit 0
"#,
                ps = self.docker_ps.display()
            ),
        );
        write_executable(
            &self.bin_dir.join("cloudflared"),
            &format!(
                r#"#!/bin/sh
echo "cloudflared $*" >> '{calls}'
case "$1" in
  --version) echo "cloudflared version 2024.6.1"; exit 0 ;;
  tunnel) touch '{marker}'; exit 0 ;;
esac
exit 0
"#
            ),
        );
        write_executable(
            &self.bin_dir.join("pgrep"),
            &format!(
                r#"#!/bin/sh
if [ -f '{marker}' ]; then echo 4242; exit 0; fi
exit 1
"#
            ),
        );
        write_executable(
            &self.bin_dir.join("systemctl"),
            "#!/bin/sh\necho \"Failed to connect to bus: No medium found\" >&2\nexit 1\n",
        );
        write_executable(
            &self.bin_dir.join("crontab"),
            &format!(
                r#"#!/bin/sh
if [ "$1" = "-l" ]; then
  if [ -f '{file}' ]; then cat '{file}'; exit 0; fi
  echo "no crontab for tester" >&2
  exit 1
fi
cat > '{file}'
"#,
                file = self.crontab.display()
            ),
        );
        symlink(gungnr_binary(), self.bin_dir.join("gungnr")).unwrap();
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(gungnr_binary());
        cmd.current_dir(&self.repo)
            .env_clear()
            .env("HOME", &self.home)
            .env("XDG_CONFIG_HOME", self.home.join(".config"))
            .env("GUNGNR_DATA_DIR", &self.data_dir)
            .env("GUNGNR_HEALTH_URL", &self.health_url)
            .env("NO_PROXY", "127.0.0.1,localhost")
            .env("PATH", format!("{}:/usr/bin:/bin", self.bin_dir.display()));
        cmd
    }

    fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    fn crontab_text(&self) -> String {
        fs::read_to_string(&self.crontab).unwrap_or_default()
    }

    fn calls_text(&self) -> String {
        fs::read_to_string(&self.calls).unwrap_or_default()
    }

    fn enable(&self) {
        self.cmd()
            .args(["keepalive", "enable"])
            .assert()
            .success()
            .stdout(contains("Supervisor: cron"));
    }
}

#[test]
fn status_reports_disabled_on_fresh_host() {
    let sb = Sandbox::new();
    sb.cmd()
        .args(["keepalive", "status"])
        .assert()
        .success()
        .stdout(contains("Keepalive Status"))
        .stdout(contains("- Status: disabled"))
        .stdout(contains("No keepalive run metadata recorded yet."))
        .stdout(contains("Cron available: yes"));
}

#[test]
fn enable_falls_back_to_cron_and_is_idempotent() {
    let sb = Sandbox::new();
    sb.enable();
    sb.enable();

    let crontab = sb.crontab_text();
    assert_eq!(crontab.matches("# gungnr-cloudflared\n").count(), 1);
    assert_eq!(crontab.matches("# gungnr-cloudflared-watch").count(), 1);
    assert!(crontab.contains("@reboot "));
    assert!(crontab.contains("*/5 * * * * "));

    let state = sb.state_dir();
    let mode = fs::metadata(state.join("cloudflared-run.sh")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_eq!(fs::read_to_string(state.join("keepalive-mode")).unwrap().trim(), "core");
    assert_eq!(
        fs::read_to_string(state.join("keepalive-compose-file")).unwrap().trim(),
        sb.repo.join("docker-compose.yml").display().to_string()
    );
    let run_script = fs::read_to_string(state.join("cloudflared-run.sh")).unwrap();
    assert!(run_script.contains(&sb.bin_dir.join("gungnr").display().to_string()));
}

#[test]
fn status_reports_enabled_after_enable() {
    let sb = Sandbox::new();
    sb.enable();
    let output = sb
        .cmd()
        .args(["--json", "keepalive", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    assert_eq!(json["result"]["status"], "enabled");
    assert_eq!(json["result"]["mode"], "core");
    assert_eq!(json["result"]["source"], "cron");
    assert_eq!(json["result"]["compose_file_exists"], true);
    assert_eq!(json["result"]["supervisor"]["cron"]["has_watch"], true);
}

#[test]
fn disable_preserves_unrelated_cron_lines() {
    let sb = Sandbox::new();
    fs::write(&sb.crontab, "0 3 * * * /usr/local/bin/backup\n").unwrap();
    sb.enable();
    assert!(sb.crontab_text().contains("gungnr-cloudflared"));

    sb.cmd()
        .args(["keepalive", "disable"])
        .assert()
        .success()
        .stdout(contains("Keepalive Disable"))
        .stdout(contains("Crontab entries: yes"))
        .stdout(contains("Mode file: yes"))
        .stdout(contains("Run script: yes"));

    let crontab = sb.crontab_text();
    assert!(crontab.contains("0 3 * * * /usr/local/bin/backup"));
    assert!(!crontab.contains("gungnr-cloudflared"));
    assert!(!sb.state_dir().join("cloudflared-run.sh").exists());
    assert!(!sb.state_dir().join("keepalive-mode").exists());

    sb.cmd()
        .args(["keepalive", "status"])
        .assert()
        .success()
        .stdout(contains("- Status: disabled"));
}

#[test]
fn recover_runs_core_stack_and_records_last_run() {
    let sb = Sandbox::new();
    sb.enable();

    let output = sb
        .cmd()
        .args(["--json", "keepalive", "recover"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], true);
    let run = &json["result"]["run"];
    assert_eq!(run["result"], "success");
    assert_eq!(run["mode"], "core");
    assert_eq!(run["trigger"], "manual");
    assert_eq!(run["recovery"]["core_recovered"], true);
    assert_eq!(run["recovery"]["api_healthy"], true);
    assert_eq!(run["recovery"]["tunnel_started"], true);
    assert_eq!(run["controls"]["api_health_timeout_raw"], "180s");

    let calls = sb.calls_text();
    assert!(calls.contains("docker compose --env-file "));
    assert!(calls.contains(" up -d"));
    assert!(calls.contains("cloudflared tunnel --config "));
    assert!(!calls.contains("docker start"));

    let state = sb.state_dir();
    let persisted: Value =
        serde_json::from_str(&fs::read_to_string(state.join("keepalive-last-run.json")).unwrap())
            .unwrap();
    assert_eq!(persisted["result"], "success");
    let log = fs::read_to_string(state.join("keepalive.log")).unwrap();
    assert!(log.contains("msg=\"keepalive recovery completed successfully\""));
    assert!(fs::read_to_string(state.join("docker-compose.log"))
        .unwrap()
        .contains("Started"));

    sb.cmd()
        .args(["keepalive", "status"])
        .assert()
        .success()
        .stdout(contains("Last Run"))
        .stdout(contains("Trigger: manual"))
        .stdout(contains("Result: success"));
}

#[test]
fn recover_without_bootstrap_env_fails_and_records_run() {
    let sb = Sandbox::new();
    sb.enable();
    fs::remove_file(sb.data_dir.join(".env")).unwrap();

    sb.cmd()
        .args(["keepalive", "recover"])
        .assert()
        .failure()
        .stdout(contains("Result: failed"))
        .stdout(contains("Run `gungnr bootstrap`"))
        .stderr(contains("bootstrap .env not found at"));

    assert!(!sb.calls_text().contains("up -d"));
    let persisted = fs::read_to_string(sb.state_dir().join("keepalive-last-run.json")).unwrap();
    assert!(persisted.contains("\"result\": \"failed\""));
}

#[test]
fn recover_rejects_relative_compose_override() {
    let sb = Sandbox::new();
    sb.enable();

    let output = sb
        .cmd()
        .env("GUNGNR_COMPOSE_FILE", "docker-compose.yml")
        .args(["--json", "keepalive", "recover"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = parse_json(&output.stdout);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_kind"], "compose file");
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("GUNGNR_COMPOSE_FILE is relative"));
    assert!(!sb.calls_text().contains("up -d"));
}

#[test]
fn all_recovers_managed_projects() {
    let sb = Sandbox::new();
    let ps = [
        ("c1", "panel", "db"),
        ("c2", "panel", "api"),
        ("c3", "panel", "web"),
        ("c4", "panel", "proxy"),
        ("b1", "blog", "web"),
        ("b2", "blog", "worker"),
    ]
    .iter()
    .map(|(id, project, service)| {
        format!(
            r#"{{"ID":"{id}","Names":"{project}-{service}-1","Status":"Exited (0) 3 minutes ago","Labels":"com.docker.compose.project={project},com.docker.compose.service={service}"}}"#
        )
    })
    .collect::<Vec<_>>()
    .join("\n");
    fs::write(&sb.docker_ps, ps).unwrap();

    let output = sb
        .cmd()
        .args(["--json", "keepalive", "all"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = parse_json(&output.stdout);
    let recovery = &json["result"]["run"]["recovery"];
    assert_eq!(json["result"]["run"]["trigger"], "manual-all");
    assert_eq!(recovery["core_project"], "panel");
    assert_eq!(recovery["managed_projects"], 1);
    assert_eq!(recovery["managed_projects_recovered"], 1);
    assert!(sb.calls_text().contains("docker start b1 b2"));
    assert_eq!(
        fs::read_to_string(sb.state_dir().join("keepalive-mode")).unwrap().trim(),
        "all"
    );
}

#[test]
fn enable_requires_installed_binary() {
    let exe = gungnr_binary();
    let is_artifact = exe
        .components()
        .any(|component| component.as_os_str() == "target");
    if !is_artifact {
        return;
    }
    let sb = Sandbox::new();
    fs::remove_file(sb.bin_dir.join("gungnr")).unwrap();

    sb.cmd()
        .args(["keepalive", "enable"])
        .assert()
        .failure()
        .stderr(contains("keepalive requires an installed gungnr binary in PATH"));
    assert!(!sb.crontab_text().contains("gungnr-cloudflared"));
}

#[test]
fn enable_requires_cloudflared_config() {
    let sb = Sandbox::new();
    fs::remove_file(sb.home.join(".cloudflared").join("config.yml")).unwrap();
    sb.cmd()
        .args(["keepalive", "enable"])
        .assert()
        .failure()
        .stderr(contains("cloudflared config not found at"));
}

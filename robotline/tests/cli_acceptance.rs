use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_config,
            xdg_state,
        }
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("robotline");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("robotline"));

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute robotline: {e}"))
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn config_reports_unset_backend() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["config"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Backend URL:      <not set>"));
    assert!(out.contains("API key:          <not set>"));
    assert!(out.contains("(not found)"));
    assert!(out.contains("Backend is not configured"));
    assert!(out.contains("up to 40 attempts"));
}

#[test]
fn config_reads_settings_file() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[backend]
url = "https://project.example.co/rest/v1/"
api_key = "secret"

[session]
max_poll_attempts = 10
instance_name = "helper"
"#,
    );

    let output = run_bin(&env, &["config"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("https://project.example.co/rest/v1/"));
    assert!(out.contains("Actions URL:      https://project.example.co/rest/v1/actions"));
    assert!(out.contains("API key:          <set>"));
    assert!(!out.contains("secret"));
    assert!(out.contains("up to 10 attempts"));
    assert!(out.contains("Instance name:    helper"));
    assert!(!out.contains("Backend is not configured"));
}

#[test]
fn invalid_config_is_rejected() {
    let env = CliTestEnv::new();
    env.write_config("[session]\nmax_poll_attempts = 0\n");

    let output = run_bin(&env, &["config"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("max_poll_attempts"));
}

#[test]
fn send_requires_backend() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["send", "--site", "site-1", "hello"]);

    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("backend is not configured"), "stderr: {err}");
    assert!(err.contains("backend.url is required"), "stderr: {err}");
}

#[test]
fn watch_requires_instance() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["watch", "--site", "site-1"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("--instance"));
}

#[test]
fn logs_are_written_to_state_dir() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["config"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let log_dir = env.xdg_state.join("robotline");
    let has_log = fs::read_dir(&log_dir)
        .expect("log dir should exist")
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().starts_with("robotline.log"));
    assert!(has_log);
}

#[test]
fn logs_follow_configured_directory() {
    let env = CliTestEnv::new();
    let log_dir = env.home.join("robot-logs");
    env.write_config(&format!(
        "[logging]\ndirectory = {:?}\n",
        log_dir.display().to_string()
    ));

    let output = run_bin(&env, &["config"]);

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains(&log_dir.join("robotline.log").display().to_string()));
    let has_log = fs::read_dir(&log_dir)
        .expect("configured log dir should exist")
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().starts_with("robotline.log"));
    assert!(has_log);
}

#[test]
fn bad_stderr_level_is_rejected() {
    let env = CliTestEnv::new();
    env.write_config("[logging]\nstderr_level = \"chatty\"\n");

    let output = run_bin(&env, &["config"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("stderr_level"));
}

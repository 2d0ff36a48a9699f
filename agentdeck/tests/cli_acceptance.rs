use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Stub agent: swallows the prompt, announces a thread and says something.
const STUB_AGENT: &str = r#"cat >/dev/null
echo '{"type":"thread.started","thread_id":"t-1"}'
echo '{"type":"item.completed","item":{"id":"i1","type":"agent_message","text":"done"}}'"#;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    data_dir: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let data_dir = base.join("data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &data_dir, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }
        write_config(&xdg_config);

        Self {
            _temp_dir: temp_dir,
            home,
            data_dir,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }
}

fn write_config(xdg_config: &std::path::Path) {
    let dir = xdg_config.join("agentdeck");
    fs::create_dir_all(&dir).expect("failed to create config dir");
    let config = format!(
        "[agent]\nexecutable = \"sh\"\nextra_args = [\"-c\", {script}, \"agent\"]\n\n[runs]\nabort_grace_ms = 300\n",
        script = toml_string(STUB_AGENT)
    );
    fs::write(dir.join("config.toml"), config).expect("failed to write config");
}

fn toml_string(value: &str) -> String {
    format!("'''\n{value}\n'''")
}

fn run_bin(env: &CliTestEnv, bin_name: &str, args: &[&str]) -> Output {
    let bin_path = match bin_name {
        "agentdeck" => PathBuf::from(assert_cmd::cargo::cargo_bin!("agentdeck")),
        "agentdeck-request" => PathBuf::from(assert_cmd::cargo::cargo_bin!("agentdeck-request")),
        _ => panic!("unsupported binary in test harness: {bin_name}"),
    };

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("AGENTDECK_DATA_DIR", &env.data_dir)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute {bin_name}: {e}"))
}

fn assert_success(bin_name: &str, args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "{bin_name} {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn status_windows(env: &CliTestEnv) -> Vec<serde_json::Value> {
    let output = run_bin(env, "agentdeck", &["status"]);
    assert_success("agentdeck", &["status"], &output);
    serde_json::from_slice(&output.stdout).expect("status prints a JSON array")
}

#[test]
fn run_streams_events_and_persists_window() {
    let env = CliTestEnv::new();
    let args = ["run", "--name", "demo", "--cwd", "/tmp", "hello"];

    let output = run_bin(&env, "agentdeck", &args);
    assert_success("agentdeck", &args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("thread.started"), "stdout:\n{stdout}");
    assert!(
        stdout.lines().any(|l| l.starts_with("run ") && l.ends_with(" completed")),
        "expected completion line, got:\n{stdout}"
    );

    let windows = status_windows(&env);
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0]["name"], "demo");
    assert_eq!(windows[0]["threadId"], "t-1");
    assert_eq!(windows[0]["status"], "idle");
}

#[test]
fn queued_requests_are_applied_by_serve() {
    let env = CliTestEnv::new();

    let window_args = [
        "window", "--id", "w9", "--name", "auto", "--cwd", "/tmp", "--sandbox", "read-only",
    ];
    let output = run_bin(&env, "agentdeck-request", &window_args);
    assert_success("agentdeck-request", &window_args, &output);
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "w9");

    let run_args = ["run", "--window", "w9", "--input", "hi"];
    let output = run_bin(&env, "agentdeck-request", &run_args);
    assert_success("agentdeck-request", &run_args, &output);

    let pending: serde_json::Value =
        serde_json::from_slice(&fs::read(env.data_dir.join("requests.json")).unwrap()).unwrap();
    assert_eq!(pending["createWindows"].as_array().unwrap().len(), 1);
    assert_eq!(pending["startRuns"].as_array().unwrap().len(), 1);

    let serve_args = ["serve", "--once"];
    let output = run_bin(&env, "agentdeck", &serve_args);
    assert_success("agentdeck", &serve_args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("1 window(s) created") && stdout.contains("1 run(s) started"),
        "stdout:\n{stdout}"
    );

    let windows = status_windows(&env);
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0]["id"], "w9");
    assert_eq!(windows[0]["source"], "automation");
    assert_eq!(windows[0]["defaultRunOptions"]["sandboxMode"], "read-only");
    assert_eq!(windows[0]["threadId"], "t-1");

    let pending: serde_json::Value =
        serde_json::from_slice(&fs::read(env.data_dir.join("requests.json")).unwrap()).unwrap();
    assert!(pending["createWindows"].as_array().unwrap().is_empty());
    assert!(pending["startRuns"].as_array().unwrap().is_empty());
}

#[test]
fn read_only_views_work_on_empty_directory() {
    let env = CliTestEnv::new();

    assert!(status_windows(&env).is_empty());

    let output = run_bin(&env, "agentdeck", &["jobs"]);
    assert_success("agentdeck", &["jobs"], &output);
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "[]");

    let output = run_bin(&env, "agentdeck", &["events", "missing-run"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing-run"));
}

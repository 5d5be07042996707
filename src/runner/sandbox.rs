use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::WatchConfig;
use crate::store::TestKind;

const PLAYWRIGHT_RUNNER: &str = include_str!("../../assets/playwright_runner.py");
const PUPPETEER_RUNNER: &str = include_str!("../../assets/puppeteer_runner.js");

// Environment keys the child inherits. Everything else (API tokens, chat
// credentials) stays in the controller process.
const KEEP_ENV: &[&str] = &[
    "PATH",
    "LANG",
    "TZ",
    "HOME",
    "CHROMIUM_PATH",
    "NODE_PATH",
];

/// Write the embedded runner programs into the data dir so children can be
/// spawned from a stable on-disk path. Idempotent; called once at startup.
pub fn materialize_runners(config: &WatchConfig) -> std::io::Result<()> {
    let dir = config.sandbox_dir();
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("playwright_runner.py"), PLAYWRIGHT_RUNNER)?;
    std::fs::write(dir.join("puppeteer_runner.js"), PUPPETEER_RUNNER)?;
    Ok(())
}

pub fn runner_program(config: &WatchConfig, kind: TestKind) -> PathBuf {
    match kind {
        TestKind::ScriptPython => config.sandbox_dir().join("playwright_runner.py"),
        TestKind::ScriptJs => config.sandbox_dir().join("puppeteer_runner.js"),
    }
}

/// Build the sandbox child command: interpreter + runner program + the
/// protocol arguments, piped stdio, and a minimal environment.
pub fn build_command(
    config: &WatchConfig,
    kind: TestKind,
    test_file: &Path,
    base_url: &str,
    artifacts_dir: &Path,
    timeout_seconds: i64,
) -> Command {
    let interpreter = match kind {
        TestKind::ScriptPython => &config.python_bin,
        TestKind::ScriptJs => &config.node_bin,
    };

    let mut cmd = Command::new(interpreter);
    cmd.arg(runner_program(config, kind))
        .arg("--test-file")
        .arg(test_file)
        .arg("--base-url")
        .arg(base_url)
        .arg("--artifacts-dir")
        .arg(artifacts_dir)
        .arg("--timeout-seconds")
        .arg(timeout_seconds.to_string())
        .current_dir(artifacts_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env_clear();

    for key in KEEP_ENV {
        if let Ok(v) = std::env::var(key) {
            cmd.env(key, v);
        }
    }
    for (key, v) in std::env::vars() {
        if key.starts_with("LC_") || key.starts_with("PUPPETEER_") {
            cmd.env(key, v);
        }
    }
    if let Some(chromium) = &config.chromium_path {
        cmd.env("CHROMIUM_PATH", chromium);
    }
    cmd.env("HOME", "/tmp");
    cmd.env("BASE_URL", base_url);
    cmd.env("ARTIFACTS_DIR", artifacts_dir);

    cmd
}

//! Common utilities for integration tests
//!
//! Wraps the `debounced` binary with an isolated environment: a temp socket
//! path, a temp config dir and no inherited `DEBOUNCED_*` variables.

#![allow(dead_code)]

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Scratch space shared by the commands of one test
pub struct TestEnv {
    dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: TempDir::new().context("Failed to create temp dir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn socket(&self) -> PathBuf {
        self.dir.path().join("debounce.sock")
    }

    /// Command with `--socket` already pointing into the temp dir
    pub fn command(&self, args: &[&str]) -> DebouncedCommand {
        let mut cmd = DebouncedCommand::new(self.path());
        cmd.args(&["--socket", &self.socket().to_string_lossy()]);
        cmd.args(args);
        cmd
    }

    /// Start `debounced serve` and wait for its socket to appear
    pub fn spawn_service(&self) -> Result<ServiceProcess> {
        self.spawn_service_with(&[])
    }

    /// Like [`spawn_service`](Self::spawn_service) with extra `serve` arguments
    pub fn spawn_service_with(&self, extra: &[&str]) -> Result<ServiceProcess> {
        let mut args = vec!["serve"];
        args.extend_from_slice(extra);
        let child = self
            .command(&args)
            .build()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn debounced serve")?;
        let process = ServiceProcess { child };

        if !wait_for(Duration::from_secs(10), || self.socket().exists()) {
            anyhow::bail!("Service socket never appeared at {}", self.socket().display());
        }
        Ok(process)
    }
}

/// Builder around the compiled binary
pub struct DebouncedCommand {
    config_home: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl DebouncedCommand {
    pub fn new(config_home: &Path) -> Self {
        Self {
            config_home: config_home.to_path_buf(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn args(&mut self, args: &[&str]) -> &mut Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn env(&mut self, key: &str, value: &str) -> &mut Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    fn build(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_debounced"));
        command
            .args(&self.args)
            .env_remove("DEBOUNCED_SOCKET")
            .env_remove("DEBOUNCED_TIMEOUT")
            .env_remove("RUST_LOG")
            .env("HOME", &self.config_home)
            .env("XDG_CONFIG_HOME", &self.config_home)
            .envs(self.env.iter().map(|(k, v)| (k, v)));
        command
    }

    pub fn execute(&self) -> Result<CommandResult> {
        let output = self.build().output().context("Failed to execute debounced")?;
        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    pub fn assert_success(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if result.exit_code != 0 {
            anyhow::bail!(
                "Command failed (exit code: {}):\nArgs: {:?}\nStdout: {}\nStderr: {}",
                result.exit_code,
                self.args,
                result.stdout,
                result.stderr
            );
        }
        Ok(result)
    }

    pub fn assert_failure(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if result.exit_code == 0 {
            anyhow::bail!(
                "Command should have failed but succeeded:\nArgs: {:?}\nStdout: {}",
                self.args,
                result.stdout
            );
        }
        Ok(result)
    }
}

pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A running `debounced serve`; killed on drop if still alive
pub struct ServiceProcess {
    child: Child,
}

impl ServiceProcess {
    /// Send SIGTERM and wait for a clean exit
    pub fn terminate(mut self) -> Result<i32> {
        let status = Command::new("kill")
            .args(["-TERM", &self.child.id().to_string()])
            .status()
            .context("Failed to run kill")?;
        anyhow::ensure!(status.success(), "kill -TERM failed");

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status.code().unwrap_or(-1));
            }
            anyhow::ensure!(Instant::now() < deadline, "service ignored SIGTERM");
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn wait_for(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}

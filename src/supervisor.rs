//! Child Supervisor — resolves, spawns, and tears down a bridged child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::ChildConfig;
use crate::error::{BridgeError, Result};

/// Directories searched for a bare command name, after PATH, before giving
/// up and falling back to an `env` launcher.
const FALLBACK_DIRS: &[&str] = &["/usr/local/bin", "/usr/bin", "/bin", "/opt/homebrew/bin"];

/// A running child process, split into the three pipes the rest of the
/// bridge needs independently.
pub struct ChildHandle {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
    pub stderr: BufReader<ChildStderr>,
}

fn expand_tilde(token: &str) -> String {
    if let Some(rest) = token.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    token.to_string()
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Resolves a command token to an executable path. Absolute and relative
/// paths (anything containing a `/`) are checked directly. Bare names are
/// left to PATH resolution by `Command`, with the fallback directories
/// tried explicitly if PATH resolution would otherwise fail, and an `env`
/// launcher as the last resort (`env <name> ...`), mirroring how a login
/// shell finds tools that aren't on a minimal inherited PATH.
fn resolve_command(config: &ChildConfig) -> Result<(String, Vec<String>)> {
    let token = expand_tilde(&config.command);

    if token.contains('/') {
        let path = Path::new(&token);
        if path.is_file() {
            return Ok((token, config.args.clone()));
        }
        return Err(BridgeError::CommandNotFound(
            config.id.clone(),
            format!("no such file: {token}"),
        ));
    }

    if which(&token).is_some() {
        return Ok((token, config.args.clone()));
    }

    for dir in FALLBACK_DIRS {
        let candidate = Path::new(dir).join(&token);
        if candidate.is_file() {
            return Ok((candidate.to_string_lossy().into_owned(), config.args.clone()));
        }
    }

    if which("env").is_some() {
        let mut args = vec![token.clone()];
        args.extend(config.args.clone());
        return Ok(("env".to_string(), args));
    }

    Err(BridgeError::CommandNotFound(
        config.id.clone(),
        format!("'{token}' not found on PATH, fallback dirs, or via env"),
    ))
}

fn which(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Spawns a child process per `config`, composing its environment from the
/// current process's environment, the fallback directories prepended to
/// PATH, and the config's own `env` overlay (which wins on conflict).
pub fn spawn(config: &ChildConfig) -> Result<ChildHandle> {
    let (program, args) = resolve_command(config)?;

    let mut path = FALLBACK_DIRS.join(":");
    if let Ok(existing) = std::env::var("PATH") {
        path = format!("{path}:{existing}");
    }

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .env("PATH", path)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &config.cwd {
        cmd.current_dir(expand_tilde(cwd));
    }

    info!(child = %config.id, program = %program, "spawning child process");

    let mut child = cmd.spawn().map_err(|e| {
        BridgeError::SpawnFailed(config.id.clone(), e.to_string())
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::SpawnFailed(config.id.clone(), "no stdin handle".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::SpawnFailed(config.id.clone(), "no stdout handle".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BridgeError::SpawnFailed(config.id.clone(), "no stderr handle".to_string()))?;

    Ok(ChildHandle {
        child,
        stdin,
        stdout: BufReader::new(stdout),
        stderr: BufReader::new(stderr),
    })
}

/// Gives the child a grace period to exit on its own (it may be reacting to
/// stdin closing) before forcing termination. `ChildHandle` is constructed
/// with `kill_on_drop`, so even a panic between here and drop is safe.
pub async fn terminate(handle: &mut ChildHandle, child_id: &str) {
    let wait = tokio::time::timeout(std::time::Duration::from_secs(3), handle.child.wait()).await;
    match wait {
        Ok(Ok(status)) => debug!(child = %child_id, %status, "child exited after terminate"),
        Ok(Err(e)) => warn!(child = %child_id, error = %e, "error waiting on child after terminate"),
        Err(_) => warn!(child = %child_id, "child did not exit within grace period, killing"),
    }
    let _ = handle.child.start_kill();
}

/// Drains a child's stderr line by line, forwarding each line to the
/// provided sink for observability. Returns when stderr is closed (which
/// normally coincides with the child exiting).
pub async fn drain_stderr<F: FnMut(String)>(mut stderr: BufReader<ChildStderr>, mut sink: F) {
    let mut line = String::new();
    loop {
        line.clear();
        match stderr.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => sink(line.trim_end().to_string()),
            Err(e) => {
                warn!(error = %e, "error reading child stderr");
                break;
            }
        }
    }
}

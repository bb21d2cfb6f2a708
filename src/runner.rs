//! Deploy script execution.
//!
//! The script is spawned directly from its path (argument vector, no
//! shell), so event fields passed through the environment are never
//! interpreted by a shell. The child:
//!
//! - runs in the script's parent directory,
//! - inherits the service's environment plus the `DEPLOY_*` variables built
//!   by [`deploy_env`],
//! - runs with the service's own privileges,
//! - leads its own process group, so a timeout can kill everything it
//!   spawned.
//!
//! Anyone who can produce a valid signature can make this run, so the
//! webhook secret is the only gate on it.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::RunError;
use crate::types::CanonicalEvent;

/// Captured result of a script that ran to completion.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, in the shape shown in notifications.
    pub fn combined(&self) -> String {
        combine(&self.stdout, &self.stderr)
    }
}

pub(crate) fn combine(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.trim_end().to_string(),
        (true, false) => stderr.trim_end().to_string(),
        (false, false) => format!("{}\nSTDERR:\n{}", stdout.trim_end(), stderr.trim_end()),
    }
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `path` with extra environment variables and wait for it, at most
    /// for the configured timeout.
    #[instrument(skip(self, env), fields(script = %path.display()))]
    pub async fn run(&self, path: &Path, env: &[(String, String)]) -> Result<ScriptOutput, RunError> {
        // Absolute, so neither PATH lookup nor current_dir changes what runs.
        let path = match path.canonicalize() {
            Ok(p) if p.is_file() => p,
            _ => return Err(RunError::NotFound(path.to_path_buf())),
        };
        let path = path.as_path();

        let mut cmd = Command::new(path);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RunError::NotFound(path.to_path_buf()),
            _ => RunError::Spawn(e),
        })?;
        let pid = child.id();
        debug!(?pid, "deploy script started");

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(RunError::Io)?,
            Err(_) => {
                warn!(?pid, timeout_secs = self.timeout.as_secs(), "deploy script timed out, killing process group");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                // Kills the direct child if the group signal missed it, and reaps it.
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "child already exited");
                }
                let (stdout, stderr) = tokio::join!(collect(stdout), collect(stderr));
                return Err(RunError::Timeout {
                    after: self.timeout,
                    stdout,
                    stderr,
                });
            }
        };

        let (stdout, stderr) = tokio::join!(collect(stdout), collect(stderr));
        let output = ScriptOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        debug!(exit_code = ?output.exit_code, duration_ms = output.duration_ms, "deploy script finished");
        Ok(output)
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed");
    }
}

/// How long to keep draining pipes after the script has exited. A
/// background child (`nohup app &`) inherits them and may never close them.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

fn spawn_reader<R>(mut reader: R) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = buf.clone();
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!(error = %e, "failed reading script output");
                    break;
                }
            }
        }
    });
    Capture { buf, handle }
}

/// Whatever was read, even if the pipe is still open.
async fn collect(capture: Option<Capture>) -> String {
    let Some(mut capture) = capture else {
        return String::new();
    };
    if tokio::time::timeout(OUTPUT_GRACE, &mut capture.handle).await.is_err() {
        debug!("output pipe held open by a background process, keeping partial output");
        capture.handle.abort();
    }
    let bytes = capture
        .buf
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let text = String::from_utf8_lossy(&bytes).into_owned();
    text
}

/// Environment handed to the deploy script describing the triggering event.
/// Values the payload omitted are left unset.
pub fn deploy_env(project: &str, event: &CanonicalEvent) -> Vec<(String, String)> {
    let mut env = vec![
        ("DEPLOY_PROJECT".to_string(), project.to_string()),
        ("DEPLOY_BRANCH".to_string(), event.branch.clone()),
        ("DEPLOY_EVENT".to_string(), event.event_type.clone()),
        ("DEPLOY_REPOSITORY".to_string(), event.repository_name.clone()),
    ];
    let optional = [
        ("DEPLOY_COMMIT_ID", &event.commit_id),
        ("DEPLOY_COMMIT_MESSAGE", &event.commit_message),
        ("DEPLOY_AUTHOR_NAME", &event.author_name),
        ("DEPLOY_AUTHOR_EMAIL", &event.author_email),
        ("DEPLOY_CLONE_URL", &event.clone_url),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            env.push((key.to_string(), value.clone()));
        }
    }
    env
}

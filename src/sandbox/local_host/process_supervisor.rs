use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{EXIT_TIMED_OUT, ExecResult, TIMEOUT_MARKER};

/// How long output readers may keep draining after a timed-out process
/// group was killed.
const READER_GRACE: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 8 * 1024;

pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "TERM"];

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// A fully resolved command line, ready to spawn.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Wraps `tokio::process::Command` with env filtering, output limits,
/// timeout, and kill. Every provider that shells out goes through here.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    /// Environment variables to inherit from host (allowlist).
    pub env_allowlist: Vec<String>,
    /// Maximum bytes kept per stream; the rest is dropped.
    pub max_output_bytes: usize,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(
            DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            DEFAULT_MAX_OUTPUT_BYTES,
        )
    }
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            env_allowlist,
            max_output_bytes,
        }
    }

    /// Build a filtered env map: only allowlisted host vars + request vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    /// Run a command to completion, capturing output.
    ///
    /// Only an empty program is an `Err`. Spawn failures and timeouts are
    /// reported through the returned `ExecResult`.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<ExecResult, SandboxError> {
        if spec.program.trim().is_empty() {
            return Err(SandboxError::Exec("empty command".into()));
        }

        let started = Instant::now();
        let env = self.build_env(&spec.env);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.env_clear();
        for (k, v) in &env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own process group, so a timeout can take down the whole tree.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(program = %spec.program, error = %e, "spawn failed");
                return Ok(ExecResult::spawn_failure(e, started.elapsed()));
            }
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, self.max_output_bytes));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, self.max_output_bytes));

        let (timed_out, exit_code) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (false, exit_code_of(status)),
            Ok(Err(e)) => {
                tracing::warn!(program = %spec.program, error = %e, "wait failed");
                (false, -1)
            }
            Err(_) => {
                kill_tree(&mut child).await;
                tracing::debug!(
                    program = %spec.program,
                    timeout_ms = timeout.as_millis() as u64,
                    "command timed out, killed"
                );
                (true, EXIT_TIMED_OUT)
            }
        };

        let grace = if timed_out { Some(READER_GRACE) } else { None };
        let stdout = collect(stdout_task, grace).await;
        let mut stderr = collect(stderr_task, grace).await;

        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("{TIMEOUT_MARKER} after {}ms", timeout.as_millis()));
        }

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code,
            duration_millis: started.elapsed().as_millis() as u64,
            timed_out,
            provider_info: None,
        })
    }
}

/// SIGKILL the child's process group, then reap the child.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: the child leads its own group (`process_group(0)`), and
            // the pid stays reserved until we reap it below.
            unsafe {
                libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
            }
        }
    }
    let _ = child.kill().await;
}

/// Run with an explicit working directory, defaulting to `fallback_dir`.
pub fn with_cwd(mut spec: CommandSpec, cwd: Option<&Path>, fallback_dir: Option<&Path>) -> CommandSpec {
    spec.cwd = cwd.or(fallback_dir).map(Path::to_path_buf);
    spec
}

fn spawn_reader<R>(stream: R, max_bytes: usize) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut reader = stream;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                // Past the cap the stream is still drained so the child
                // never blocks on a full pipe.
                Ok(n) => {
                    let room = max_bytes.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
        buf
    })
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>, grace: Option<Duration>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    let bytes = match grace {
        None => (&mut task).await.unwrap_or_default(),
        Some(grace) => match tokio::time::timeout(grace, &mut task).await {
            Ok(res) => res.unwrap_or_default(),
            Err(_) => {
                task.abort();
                Vec::new()
            }
        },
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(vec!["PATH".into()], 1024 * 1024)
    }

    #[tokio::test]
    async fn run_echo() {
        let spec = CommandSpec::new("echo").args(["hello sandbox"]);
        let result = supervisor().run(&spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert_eq!(result.stdout, "hello sandbox\n");
    }

    #[tokio::test]
    async fn run_nonzero_exit() {
        let spec = CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 42"]);
        let result = supervisor().run(&spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn run_timeout_kills_and_reports() {
        let spec = CommandSpec::new("sleep").args(["5"]);
        let started = Instant::now();
        let result = supervisor().run(&spec, Duration::from_millis(50)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.timed_out);
        assert_eq!(result.exit_code, EXIT_TIMED_OUT);
        assert!(result.stderr.contains(TIMEOUT_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_timeout_kills_the_whole_process_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("late");
        let script = format!("sh -c 'sleep 1; touch {}' & sleep 5", marker.display());
        let spec = CommandSpec::new("sh").args(["-c", script.as_str()]);

        let started = Instant::now();
        let result = supervisor().run(&spec, Duration::from_millis(50)).await.unwrap();
        let elapsed = started.elapsed();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, EXIT_TIMED_OUT);
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(!marker.exists(), "grandchild survived the timeout");
    }

    #[tokio::test]
    async fn run_caps_output_without_newlines() {
        let sup = ProcessSupervisor::new(vec!["PATH".into()], 1000);
        let spec = CommandSpec::new("sh").args(["-c", "head -c 200000 /dev/zero | tr '\\0' x"]);
        let result = sup.run(&spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.len(), 1000);
        assert!(result.stdout.bytes().all(|b| b == b'x'));
    }

    #[tokio::test]
    async fn run_env_filtering() {
        let mut spec = CommandSpec::new("sh").args(["-c", "echo \"$MY_VAR|$HOME\""]);
        spec.env.insert("MY_VAR".into(), "my_value".into());
        // Only PATH is allowlisted; HOME must not leak through
        let result = supervisor().run(&spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.stdout.trim(), "my_value|");
    }

    #[tokio::test]
    async fn run_respects_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = with_cwd(CommandSpec::new("pwd"), None, Some(tmp.path()));
        let result = supervisor().run(&spec, Duration::from_secs(5)).await.unwrap();
        let reported = PathBuf::from(result.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            tmp.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn run_truncates_output() {
        let sup = ProcessSupervisor::new(vec!["PATH".into()], 4);
        let spec = CommandSpec::new("echo").args(["abcdefgh"]);
        let result = sup.run(&spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.stdout, "abcd");
    }

    #[tokio::test]
    async fn spawn_failure_is_a_result() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz");
        let result = supervisor().run(&spec, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, crate::sandbox::types::EXIT_SPAWN_FAILED);
        assert!(result.stderr.starts_with("failed to spawn"));
    }

    #[tokio::test]
    async fn empty_command_errors() {
        let spec = CommandSpec::new("  ");
        assert!(matches!(
            supervisor().run(&spec, Duration::from_secs(1)).await,
            Err(SandboxError::Exec(_))
        ));
    }
}

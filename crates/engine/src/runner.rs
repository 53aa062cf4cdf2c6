//! Runner for short-lived external tool invocations (probes, thumbnails,
//! waveforms, preview chunks).
//!
//! Every call is bounded by a timeout and can be cancelled. Long-running
//! conversions go through [`crate::supervisor::ProcessSupervisor`] instead,
//! which streams the diagnostic output as it arrives.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Default bound for a single tool invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors produced while running an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The binary could not be located.
    #[error("{tool} not found; is it installed and on PATH?")]
    Missing { tool: String },

    /// The process could not be started.
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The process exited with a non-zero status.
    #[error("{tool} exited with status {code:?}: {stderr}")]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The process exceeded its timeout and was killed.
    #[error("{tool} timed out after {timeout:?}")]
    TimedOut { tool: String, timeout: Duration },

    /// The invocation was cancelled and the process killed.
    #[error("{tool} was cancelled")]
    Cancelled { tool: String },

    /// Waiting on the process failed.
    #[error("I/O error while running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Cancelled { .. })
    }
}

/// A fully described external tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, s: impl Into<String>) -> Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    /// File name of the program, used in error messages and logs.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

/// Output captured from a successful invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes external tools. Implemented by [`SystemRunner`]; tests substitute
/// recording fakes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError>;
}

pub type SharedRunner = Arc<dyn CommandRunner>;

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn shared() -> SharedRunner {
        Arc::new(SystemRunner)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let tool = invocation.tool_name();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        // Dropping the wait future drops the child, which kills it.
        let waited = tokio::select! {
            res = tokio::time::timeout(invocation.timeout, child.wait_with_output()) => res,
            _ = cancel.cancelled() => return Err(ToolError::Cancelled { tool }),
        };

        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(ToolError::Io { tool, source }),
            Err(_elapsed) => {
                return Err(ToolError::TimedOut {
                    tool,
                    timeout: invocation.timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool,
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

/// Recording fake runner for tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    type Responder = dyn Fn(&ToolInvocation) -> Result<ToolOutput, ToolError> + Send + Sync;
    type Latency = dyn Fn(&ToolInvocation) -> Option<Duration> + Send + Sync;

    pub struct FakeRunner {
        calls: Mutex<Vec<ToolInvocation>>,
        respond: Box<Responder>,
        latency: Box<Latency>,
    }

    impl FakeRunner {
        pub fn new(
            respond: impl Fn(&ToolInvocation) -> Result<ToolOutput, ToolError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Self::slow(respond, |_| None)
        }

        /// Invocations for which `latency` returns a duration take that long
        /// before responding, and end early as cancelled if their token fires.
        pub fn slow(
            respond: impl Fn(&ToolInvocation) -> Result<ToolOutput, ToolError> + Send + Sync + 'static,
            latency: impl Fn(&ToolInvocation) -> Option<Duration> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
                latency: Box::new(latency),
            })
        }

        pub fn calls(&self) -> Vec<ToolInvocation> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn count_matching(&self, pred: impl Fn(&ToolInvocation) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            invocation: &ToolInvocation,
            cancel: &CancellationToken,
        ) -> Result<ToolOutput, ToolError> {
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled {
                    tool: invocation.tool_name(),
                });
            }
            self.calls.lock().unwrap().push(invocation.clone());
            if let Some(delay) = (self.latency)(invocation) {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(ToolError::Cancelled {
                            tool: invocation.tool_name(),
                        })
                    }
                }
            }
            (self.respond)(invocation)
        }
    }

    /// Canned ffprobe answers for a source with the given duration and audio
    /// channel counts; every other tool writes its last argument as a file.
    pub fn media_responder(
        duration: f64,
        channels: Vec<u32>,
    ) -> impl Fn(&ToolInvocation) -> Result<ToolOutput, ToolError> + Send + Sync + 'static {
        move |inv: &ToolInvocation| {
            let joined = inv.args.join(" ");
            if inv.tool_name() == "ffprobe" {
                let stdout = if joined.contains("format=duration") {
                    format!("duration={}\n", duration)
                } else if joined.contains("-select_streams a") {
                    channels
                        .iter()
                        .enumerate()
                        .map(|(i, c)| format!("index={}\nchannels={}\n", i + 1, c))
                        .collect()
                } else {
                    "codec_name=h264\npix_fmt=yuv420p\nfield_order=progressive\n".to_string()
                };
                return Ok(ToolOutput {
                    stdout,
                    stderr: String::new(),
                });
            }
            write_last_arg(inv)
        }
    }

    /// Create the file named by the invocation's last argument.
    pub fn write_last_arg(inv: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        if let Some(out) = inv.args.last() {
            let path = Path::new(out);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| ToolError::Io {
                    tool: inv.tool_name(),
                    source,
                })?;
            }
            std::fs::write(path, b"fake").map_err(|source| ToolError::Io {
                tool: inv.tool_name(),
                source,
            })?;
        }
        Ok(ToolOutput::default())
    }
}

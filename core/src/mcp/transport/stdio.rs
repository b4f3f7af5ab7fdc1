/// Child-process binding
///
/// Spawns the endpoint's command and speaks newline-delimited JSON over its
/// stdin/stdout. Stderr is forwarded to debug logs. End of stdout while
/// connected is reported as a close.
use super::rpc::{EventReceiver, RpcChannel};
use super::{Transport, TransportEvent};
use crate::mcp::config::EndpointConfig;
use crate::mcp::error::{McpError, Result};
use crate::mcp::types::JsonRpcMessage;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// How long a child gets to exit on its own after stdin closes
const EXIT_GRACE: Duration = Duration::from_millis(500);

pub struct StdioTransport {
    config: EndpointConfig,
    rpc: Arc<RpcChannel>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    pub fn new(config: EndpointConfig, request_timeout: Duration) -> (Self, EventReceiver) {
        let (rpc, events) = RpcChannel::new(config.id.clone(), request_timeout);
        let transport = Self {
            config,
            rpc: Arc::new(rpc),
            stdin: Mutex::new(None),
            child: Mutex::new(None),
        };
        (transport, events)
    }

    fn spawn(&self) -> Result<Child> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| McpError::Config("stdio endpoint has no command".to_string()))?;

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref cwd) = self.config.cwd {
            cmd.current_dir(cwd);
        }

        cmd.spawn().map_err(|e| {
            error!(target: "mcp_transport", endpoint = %self.config.id, error = %e, "Failed to spawn endpoint process");
            McpError::Transport(format!("Failed to spawn process '{}': {}", command, e))
        })
    }

    fn spawn_reader(&self, stdout: ChildStdout) {
        let rpc = Arc::clone(&self.rpc);

        tokio::spawn(async move {
            let mut frames = BufReader::new(stdout).split(b'\n');

            loop {
                match frames.next_segment().await {
                    Ok(Some(frame)) => {
                        let line = match String::from_utf8(frame) {
                            Ok(line) => line,
                            Err(e) => {
                                warn!(
                                    target: "mcp_transport",
                                    endpoint = %rpc.label(),
                                    error = %e,
                                    "Dropping non-UTF-8 frame from endpoint"
                                );
                                rpc.emit(TransportEvent::Error(format!("invalid UTF-8 frame: {e}")));
                                continue;
                            }
                        };
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::parse(line) {
                            Ok(message) => rpc.dispatch(message),
                            Err(e) => {
                                warn!(
                                    target: "mcp_transport",
                                    endpoint = %rpc.label(),
                                    error = %e,
                                    "Dropping malformed frame from endpoint"
                                );
                                rpc.emit(TransportEvent::Error(e.to_string()));
                            }
                        }
                    }
                    Ok(None) => {
                        rpc.close("process exited");
                        break;
                    }
                    Err(e) => {
                        rpc.close(&format!("stdout read failed: {e}"));
                        break;
                    }
                }
            }

            debug!(target: "mcp_transport", endpoint = %rpc.label(), "Stdout reader exited");
        });
    }

    fn spawn_stderr_forwarder(&self, stderr: ChildStderr) {
        let label = self.config.id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "mcp_transport", endpoint = %label, stderr = %line, "endpoint stderr");
            }
        });
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn rpc(&self) -> &RpcChannel {
        &self.rpc
    }

    async fn connect(&self) -> Result<()> {
        self.rpc.begin_connect()?;

        info!(
            target: "mcp_transport",
            endpoint = %self.config.id,
            command = ?self.config.command,
            "Spawning endpoint process"
        );

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.rpc.abort_connect();
                return Err(e);
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.rpc.abort_connect();
            let _ = child.kill().await;
            return Err(McpError::Transport("Failed to capture child stdio".to_string()));
        };
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_forwarder(stderr);
        }

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        self.rpc.mark_connected();
        self.spawn_reader(stdout);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.rpc.shutdown();

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if timeout(EXIT_GRACE, child.wait()).await.is_err() {
                debug!(target: "mcp_transport", endpoint = %self.config.id, "Killing endpoint process");
                let _ = child.kill().await;
            }
        }

        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let mut line = message.to_line()?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::TransportDisconnected)?;

        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            error!(target: "mcp_transport", endpoint = %self.config.id, error = %e, "Failed to write frame");
            McpError::Io(e)
        })?;
        stdin.flush().await?;
        Ok(())
    }
}

//! One supervised tool subprocess: spawn, handshake, request multiplexing,
//! graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use cortex_core::config::ToolServerConfig;
use cortex_core::error::{CortexError, Result};
use cortex_core::types::ToolCallMeta;

use crate::pool::ToolServer;
use crate::rpc::{self, Incoming};

/// Handshake must complete within this window.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Every outbound request must be answered within this window.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between EOF-on-stdin and force kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// A running tool server child process.
pub struct ToolChild {
    name: String,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    child: Arc<Mutex<Option<Child>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    initialized_rx: watch::Receiver<bool>,
    tools: Mutex<Option<Vec<String>>>,
}

impl ToolChild {
    /// Spawn the configured server and complete the `initialize` handshake.
    pub async fn start(config: &ToolServerConfig) -> Result<Self> {
        let mut command = tokio::process::Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            CortexError::ToolExecution {
                tool: config.name.clone(),
                message: format!("failed to spawn '{}': {}", config.command, e),
            }
        })?;

        let stdin = child.stdin.take().ok_or_else(|| CortexError::ToolExecution {
            tool: config.name.clone(),
            message: "child has no stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| CortexError::ToolExecution {
            tool: config.name.clone(),
            message: "child has no stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let name = config.name.clone();
        let alive = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stdin = Arc::new(Mutex::new(Some(stdin)));
        let (initialized_tx, initialized_rx) = watch::channel(false);

        // Diagnostics stream goes to our log, tagged with the server name.
        if let Some(stderr) = stderr {
            let name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(server = %name, "{}", line);
                    }
                }
            });
        }

        // Background stdout reader: resolves responses, answers
        // server-to-client requests, watches for `initialized`.
        {
            let name = name.clone();
            let alive = alive.clone();
            let pending = pending.clone();
            let stdin = stdin.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Some(frame) = rpc::parse_incoming(&line) else {
                        if !line.trim().is_empty() {
                            debug!(server = %name, "Non-JSON stdout: {}", &line[..line.len().min(200)]);
                        }
                        continue;
                    };

                    match frame {
                        Incoming::Response { id, result } => {
                            let mut map = pending.lock().await;
                            if let Some(tx) = map.remove(&id) {
                                let result = result.map_err(|e| CortexError::ToolExecution {
                                    tool: name.clone(),
                                    message: format!("[{}] {}", e.code, e.message),
                                });
                                let _ = tx.send(result);
                            }
                        }
                        Incoming::Request { id, method, .. } => {
                            // Answer with an empty result so the child never
                            // blocks on us; the pool offers no client services.
                            debug!(server = %name, method = %method, "Answering server request");
                            let reply = rpc::response_frame(&id, &Value::Object(Default::default()));
                            let mut guard = stdin.lock().await;
                            if let Some(stdin) = guard.as_mut() {
                                let _ = stdin.write_all(reply.as_bytes()).await;
                                let _ = stdin.flush().await;
                            }
                        }
                        Incoming::Notification { method, .. } => {
                            if method == "initialized" {
                                let _ = initialized_tx.send(true);
                            } else {
                                debug!(server = %name, method = %method, "Notification");
                            }
                        }
                    }
                }

                // Child stdout closed: reject everything in flight.
                alive.store(false, Ordering::SeqCst);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(CortexError::ToolChildExit(name.clone())));
                }
                info!(server = %name, "Tool server exited");
            });
        }

        let this = Self {
            name,
            stdin,
            child: Arc::new(Mutex::new(Some(child))),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            initialized_rx,
            tools: Mutex::new(None),
        };

        this.initialize().await?;
        Ok(this)
    }

    /// Send `initialize` and wait for the `initialized` notification.
    async fn initialize(&self) -> Result<()> {
        let handshake = async {
            let params = serde_json::json!({
                "protocolVersion": rpc::PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "cortex",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            self.request_with_timeout("initialize", params, INIT_TIMEOUT).await?;

            let mut rx = self.initialized_rx.clone();
            while !*rx.borrow() {
                rx.changed().await.map_err(|_| CortexError::ToolChildExit(self.name.clone()))?;
            }
            Ok::<(), CortexError>(())
        };

        match tokio::time::timeout(INIT_TIMEOUT, handshake).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CortexError::ToolTimeout {
                    method: "initialize".into(),
                    timeout_secs: INIT_TIMEOUT.as_secs(),
                })
            }
        }

        info!(server = %self.name, "Tool server initialized");
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, REQUEST_TIMEOUT).await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(CortexError::ToolChildExit(self.name.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = rpc::request_frame(id, method, &params);
        {
            let mut guard = self.stdin.lock().await;
            let stdin = guard
                .as_mut()
                .ok_or_else(|| CortexError::ToolChildExit(self.name.clone()))?;
            stdin
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| CortexError::ToolExecution {
                    tool: self.name.clone(),
                    message: format!("write {}: {}", method, e),
                })?;
            stdin.flush().await.map_err(|e| CortexError::ToolExecution {
                tool: self.name.clone(),
                message: format!("flush {}: {}", method, e),
            })?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CortexError::ToolChildExit(self.name.clone())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CortexError::ToolTimeout {
                    method: method.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Terminate the child: EOF on stdin first, kill after the grace period.
    pub async fn disconnect(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.stdin.lock().await.take();

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => debug!(server = %self.name, "Tool server exited gracefully"),
                Err(_) => {
                    warn!(server = %self.name, "Tool server did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }

        let mut map = self.pending.lock().await;
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(CortexError::ToolChildExit(self.name.clone())));
        }
    }
}

impl ToolServer for ToolChild {
    fn name(&self) -> &str {
        &self.name
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn tools(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            {
                let cached = self.tools.lock().await;
                if let Some(tools) = cached.as_ref() {
                    return Ok(tools.clone());
                }
            }

            let result = self.request("tools/list", serde_json::json!({})).await?;
            let names: Vec<String> = result
                .get("tools")
                .and_then(Value::as_array)
                .map(|tools| {
                    tools
                        .iter()
                        .filter_map(|t| t.get("name").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            debug!(server = %self.name, count = names.len(), "Listed tools");
            *self.tools.lock().await = Some(names.clone());
            Ok(names)
        })
    }

    fn refresh_tools(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            *self.tools.lock().await = None;
            self.tools().await
        })
    }

    fn call(
        &self,
        tool: &str,
        args: Value,
        meta: ToolCallMeta,
    ) -> BoxFuture<'_, Result<Value>> {
        let tool = tool.to_string();
        Box::pin(async move {
            let params = serde_json::json!({
                "name": tool,
                "arguments": args,
                "_meta": meta,
            });
            self.request("tools/call", params).await
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.disconnect())
    }
}

//! Chrome DevTools Protocol session
//!
//! Spawns a Chromium-family browser with a fixed flag set, connects to
//! its DevTools WebSocket, and exposes the handful of protocol commands
//! the runtime needs. One [`CdpSession`] is one page in one process;
//! its lifetime token fires when the socket dies or the child exits,
//! which is how the runtime detects crashes lazily.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::error::{BrowseError, Result};

/// How long to wait for the DevTools endpoint to come up and dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// WebSocket read timeout; a silent socket past this is treated as dead.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Browser binaries probed in order.
const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

/// Feature list disabled at launch. WebAuthentication is included on top
/// of the engine defaults to avoid segfaults on FIDO-enabled sites.
const DISABLED_FEATURES: &str =
    "site-per-process,Translate,BlinkGenPropertyTrees,WebAuthentication";

/// An asynchronous protocol event (console call, download progress, …).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

type CommandResult = Result<Value>;

/// A live DevTools session over one browser process and one page.
pub struct CdpSession {
    cmd_tx: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<CommandResult>>>>,
    next_id: AtomicU64,
    page_session_id: String,
    lifetime: CancellationToken,
}

impl CdpSession {
    /// Launch a browser and bootstrap a page target: viewport 1280x720,
    /// Page/Runtime events enabled, downloads allowed into
    /// `download_dir` with lifecycle events on. Protocol events are
    /// forwarded to `events`.
    pub async fn spawn(
        download_dir: &Path,
        events: mpsc::UnboundedSender<CdpEvent>,
    ) -> Result<Arc<CdpSession>> {
        let user_data_dir = std::env::temp_dir().join(format!(
            "confab-browser-{}",
            uuid::Uuid::new_v4().simple()
        ));

        let mut child = None;
        let mut last_error = String::from("no browser binary found");
        for binary in BROWSER_CANDIDATES {
            let spawned = Command::new(binary)
                .arg("--headless=new")
                .arg("--no-sandbox")
                .arg("--disable-dbus")
                .arg("--disable-gpu")
                .arg(format!("--disable-features={DISABLED_FEATURES}"))
                .arg("--remote-debugging-port=0")
                .arg(format!("--user-data-dir={}", user_data_dir.display()))
                .arg("about:blank")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(c) => {
                    child = Some(c);
                    break;
                }
                Err(e) => last_error = format!("{binary}: {e}"),
            }
        }
        let mut child = child.ok_or_else(|| BrowseError::Start(last_error))?;

        // The DevTools WebSocket URL is announced on stderr.
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BrowseError::Start("stderr not captured".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();
        let ws_url = tokio::time::timeout(DIAL_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(rest) = line.strip_prefix("DevTools listening on ") {
                    return Some(rest.trim().to_string());
                }
            }
            None
        })
        .await
        .map_err(|_| BrowseError::Start("timed out waiting for DevTools endpoint".to_string()))?
        .ok_or_else(|| {
            BrowseError::Start("browser exited before announcing DevTools endpoint".to_string())
        })?;

        // Keep draining stderr so the child never blocks on a full pipe.
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

        let (ws, _) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| BrowseError::Start("timed out dialing DevTools WebSocket".to_string()))?
            .map_err(|e| BrowseError::Start(format!("WebSocket dial failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let lifetime = CancellationToken::new();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<CommandResult>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Child supervisor: a cancelled lifetime kills the process, a
        // dead process cancels the lifetime.
        {
            let lifetime = lifetime.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = lifetime.cancelled() => {}
                    status = child.wait() => {
                        tracing::warn!(?status, "browser process exited");
                    }
                }
                lifetime.cancel();
                let _ = child.kill().await;
            });
        }

        // Writer: serialized command frames out.
        {
            let lifetime = lifetime.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = lifetime.cancelled() => break,
                        frame = cmd_rx.recv() => {
                            let Some(frame) = frame else { break };
                            if sink.send(WsMessage::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Reader: route responses by id, fan events out.
        {
            let lifetime = lifetime.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = lifetime.cancelled() => break,
                        frame = tokio::time::timeout(READ_TIMEOUT, stream.next()) => frame,
                    };
                    let msg = match frame {
                        Err(_) => {
                            tracing::warn!("DevTools read timed out");
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(e))) => {
                            tracing::warn!(error = %e, "DevTools read failed");
                            break;
                        }
                        Ok(Some(Ok(msg))) => msg,
                    };
                    let text = match msg {
                        WsMessage::Text(text) => text,
                        WsMessage::Close(_) => break,
                        _ => continue,
                    };
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
                        let waiter = pending.lock().unwrap().remove(&id);
                        if let Some(tx) = waiter {
                            let result = match value.get("error") {
                                Some(err) => Err(BrowseError::Protocol(
                                    err.get("message")
                                        .and_then(|m| m.as_str())
                                        .unwrap_or("unknown protocol error")
                                        .to_string(),
                                )),
                                None => {
                                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                                }
                            };
                            let _ = tx.send(result);
                        }
                    } else if let Some(method) = value.get("method").and_then(|v| v.as_str()) {
                        let params = value.get("params").cloned().unwrap_or(Value::Null);
                        let _ = events.send(CdpEvent {
                            method: method.to_string(),
                            params,
                        });
                    }
                }
                lifetime.cancel();
                let mut pending = pending.lock().unwrap();
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(BrowseError::ConnectionClosed(
                        "reader exited".to_string(),
                    )));
                }
            });
        }

        let mut session = CdpSession {
            cmd_tx,
            pending,
            next_id: AtomicU64::new(0),
            page_session_id: String::new(),
            lifetime,
        };

        // Attach a page target and configure it.
        let target = session
            .browser_command("Target.createTarget", json!({"url": "about:blank"}))
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrowseError::Protocol("createTarget returned no targetId".to_string()))?
            .to_string();
        let attached = session
            .browser_command(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
            )
            .await?;
        session.page_session_id = attached
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BrowseError::Protocol("attachToTarget returned no sessionId".to_string())
            })?
            .to_string();

        session.command("Page.enable", json!({})).await?;
        session.command("Runtime.enable", json!({})).await?;
        session.set_viewport(1280, 720).await?;
        session
            .browser_command(
                "Browser.setDownloadBehavior",
                json!({
                    "behavior": "allowAndName",
                    "downloadPath": download_dir.to_string_lossy(),
                    "eventsEnabled": true,
                }),
            )
            .await?;

        Ok(Arc::new(session))
    }

    /// Token fired when the process or the socket dies, and by
    /// [`close`](Self::close).
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub fn is_alive(&self) -> bool {
        !self.lifetime.is_cancelled()
    }

    /// Terminate the session and kill the browser process.
    pub fn close(&self) {
        self.lifetime.cancel();
    }

    /// A page-scoped protocol command.
    pub async fn command(&self, method: &str, params: Value) -> Result<Value> {
        self.command_inner(Some(&self.page_session_id), method, params)
            .await
    }

    /// A browser-scoped protocol command.
    pub async fn browser_command(&self, method: &str, params: Value) -> Result<Value> {
        self.command_inner(None, method, params).await
    }

    async fn command_inner(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut frame = json!({"id": id, "method": method, "params": params});
        if let Some(session_id) = session_id {
            frame["sessionId"] = json!(session_id);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        if self.cmd_tx.send(frame.to_string()).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(BrowseError::ConnectionClosed(
                "command channel closed".to_string(),
            ));
        }

        tokio::select! {
            result = rx => result.map_err(|_| {
                BrowseError::ConnectionClosed("response dropped".to_string())
            })?,
            _ = self.lifetime.cancelled() => {
                self.pending.lock().unwrap().remove(&id);
                Err(BrowseError::ConnectionClosed("browser closed".to_string()))
            }
        }
    }

    /// Navigate and wait for the document body to be ready.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let result = self.command("Page.navigate", json!({"url": url})).await?;
        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str()) {
            if !error_text.is_empty() {
                return Err(BrowseError::Protocol(error_text.to_string()));
            }
        }
        self.wait_ready("body").await
    }

    /// Poll until the selector exists and the document has finished
    /// loading. Callers bound this with their own timeout.
    pub async fn wait_ready(&self, selector: &str) -> Result<()> {
        let selector_json = serde_json::to_string(selector)?;
        let probe = format!(
            "document.querySelector({selector_json}) !== null && document.readyState !== 'loading'"
        );
        loop {
            if self.evaluate(&probe, false).await? == json!(true) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Evaluate a JavaScript expression, returning its JSON value.
    pub async fn evaluate(&self, expression: &str, await_promise: bool) -> Result<Value> {
        let result = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": await_promise,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let description = exception
                .pointer("/exception/description")
                .and_then(|v| v.as_str())
                .or_else(|| exception.get("text").and_then(|v| v.as_str()))
                .unwrap_or("javascript exception");
            return Err(BrowseError::Protocol(description.to_string()));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    /// Emulate a viewport of the given size.
    pub async fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        self.command(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": width,
                "height": height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;
        Ok(())
    }

    /// Bounding box of the first element matching the selector.
    pub async fn element_box(&self, selector: &str) -> Result<(f64, f64, f64, f64)> {
        let selector_json = serde_json::to_string(selector)?;
        let expr = format!(
            "JSON.stringify(document.querySelector({selector_json}).getBoundingClientRect())"
        );
        let raw = self.evaluate(&expr, false).await?;
        let raw = raw
            .as_str()
            .ok_or_else(|| BrowseError::Protocol("bounding rect unavailable".to_string()))?;
        let rect: Value = serde_json::from_str(raw)?;
        let field = |name: &str| rect.get(name).and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok((field("x"), field("y"), field("width"), field("height")))
    }

    /// Capture a PNG screenshot, optionally clipped to a box.
    pub async fn capture_screenshot(
        &self,
        clip: Option<(f64, f64, f64, f64)>,
    ) -> Result<Vec<u8>> {
        let mut params = json!({"format": "png"});
        if let Some((x, y, width, height)) = clip {
            params["clip"] = json!({
                "x": x, "y": y, "width": width, "height": height, "scale": 1,
            });
        }
        let result = self.command("Page.captureScreenshot", params).await?;
        let data = result
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrowseError::Protocol("screenshot returned no data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| BrowseError::Protocol(format!("screenshot decode failed: {e}")))
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

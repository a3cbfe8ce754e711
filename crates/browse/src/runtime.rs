//! The shared browser runtime
//!
//! One [`BrowseRuntime`] per server process. The browser starts lazily
//! on first demand, is torn down after an idle period or an observed
//! crash, and is re-created on the next action. The lifecycle mutex
//! guards start/stop only; actions fetch the live session handle and
//! run without holding it.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use confab_core::llm::ToolResultContent;
use confab_core::tools::ToolOut;

use crate::cdp::{CdpEvent, CdpSession};
use crate::error::Result;
use crate::imageutil;

/// How long to wait before shutting down an idle browser.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default per-action timeout.
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Console ring buffer capacity; newest entries win.
const MAX_CONSOLE_LOGS: usize = 100;

/// Size in bytes above which console logs and eval results are written
/// to a side file instead of being returned inline.
const SPILL_THRESHOLD: usize = 1024;

/// Grace period for download events after an aborted navigation.
const DOWNLOAD_SETTLE: Duration = Duration::from_millis(500);

/// Retries for renaming a finished download that may still be written.
const RENAME_RETRIES: u32 = 10;
const RENAME_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct BrowseConfig {
    pub screenshot_dir: PathBuf,
    pub download_dir: PathBuf,
    pub console_logs_dir: PathBuf,
    /// Zero means the 30 minute default.
    pub idle_timeout: Duration,
    /// Maximum pixel dimension for returned images; 0 means unlimited.
    pub max_image_dimension: u32,
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            screenshot_dir: PathBuf::from("/tmp/confab-screenshots"),
            download_dir: PathBuf::from("/tmp/confab-downloads"),
            console_logs_dir: PathBuf::from("/tmp/confab-console-logs"),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_image_dimension: 0,
        }
    }
}

/// Tracking record for one browser download, keyed by engine GUID.
#[derive(Debug, Clone, Default)]
pub struct DownloadRecord {
    pub guid: String,
    pub url: String,
    pub suggested_filename: String,
    pub final_path: String,
    pub completed: bool,
    pub error: String,
}

/// Reports whether a URL definitely uses port 80. An explicit port
/// trumps the scheme; a bare `http` URL implies 80.
pub fn is_port80(url_str: &str) -> bool {
    let Ok(url) = Url::parse(url_str) else {
        return false;
    };
    match url.port() {
        Some(port) => port == 80,
        None => url.scheme() == "http",
    }
}

/// Parse an optional humantime duration string ("15s", "2m"), falling
/// back to the 15 second default when absent or invalid.
fn parse_timeout(timeout: Option<&str>) -> Duration {
    timeout
        .and_then(|t| humantime::parse_duration(t).ok())
        .unwrap_or(DEFAULT_ACTION_TIMEOUT)
}

fn short_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

struct SessionSlot {
    session: Option<Arc<CdpSession>>,
    idle_timer: Option<JoinHandle<()>>,
    generation: u64,
}

/// The shared browser resource and its action surface.
pub struct BrowseRuntime {
    config: BrowseConfig,
    slot: tokio::sync::Mutex<SessionSlot>,
    console: Arc<Mutex<VecDeque<Value>>>,
    downloads: Arc<Mutex<HashMap<String, DownloadRecord>>>,
}

// ============================================================================
// Action inputs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct NavigateInput {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EvalInput {
    #[serde(default)]
    pub expression: String,
    #[serde(default, rename = "await")]
    pub await_promise: Option<bool>,
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResizeInput {
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScreenshotInput {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConsoleLogsInput {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReadImageInput {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub timeout: Option<String>,
}

impl BrowseRuntime {
    pub fn new(config: BrowseConfig) -> Self {
        let mut config = config;
        if config.idle_timeout.is_zero() {
            config.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        for dir in [
            &config.screenshot_dir,
            &config.download_dir,
            &config.console_logs_dir,
        ] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to create directory");
            }
        }
        Self {
            config,
            slot: tokio::sync::Mutex::new(SessionSlot {
                session: None,
                idle_timer: None,
                generation: 0,
            }),
            console: Arc::new(Mutex::new(VecDeque::new())),
            downloads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &BrowseConfig {
        &self.config
    }

    /// Fetch the live session, starting or restarting the browser as
    /// needed, and re-arm the idle timer.
    async fn get_session(self: &Arc<Self>) -> Result<Arc<CdpSession>> {
        let mut slot = self.slot.lock().await;

        if let Some(session) = slot.session.clone() {
            if session.is_alive() {
                self.arm_idle_timer(&mut slot);
                return Ok(session);
            }
            tracing::warn!("browser session is dead, restarting");
            session.close();
            slot.session = None;
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = CdpSession::spawn(&self.config.download_dir, event_tx).await?;
        self.spawn_event_consumer(event_rx);
        slot.session = Some(session.clone());
        self.arm_idle_timer(&mut slot);
        tracing::info!("browser started");
        Ok(session)
    }

    fn arm_idle_timer(self: &Arc<Self>, slot: &mut SessionSlot) {
        if let Some(timer) = slot.idle_timer.take() {
            timer.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        let runtime = Arc::clone(self);
        let idle = self.config.idle_timeout;
        slot.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            runtime.idle_shutdown(generation).await;
        }));
    }

    async fn idle_shutdown(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            return;
        }
        if let Some(session) = slot.session.take() {
            tracing::info!(idle = ?self.config.idle_timeout, "browser idle, shutting down");
            session.close();
        }
        slot.idle_timer = None;
    }

    /// Shut the browser down explicitly.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(timer) = slot.idle_timer.take() {
            timer.abort();
        }
        if let Some(session) = slot.session.take() {
            session.close();
        }
    }

    fn spawn_event_consumer(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<CdpEvent>) {
        let console = self.console.clone();
        let downloads = self.downloads.clone();
        let download_dir = self.config.download_dir.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event.method.as_str() {
                    "Runtime.consoleAPICalled" => {
                        push_console_log(&console, event.params);
                    }
                    "Browser.downloadWillBegin" => {
                        handle_download_will_begin(&downloads, &event.params);
                    }
                    "Browser.downloadProgress" => {
                        handle_download_progress(&downloads, &download_dir, &event.params).await;
                    }
                    _ => {}
                }
            }
        });
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Drain completed download records, so each download is reported at
    /// most once.
    pub fn take_completed_downloads(&self) -> Vec<DownloadRecord> {
        let mut downloads = self.downloads.lock().unwrap();
        let completed_guids: Vec<String> = downloads
            .iter()
            .filter(|(_, record)| record.completed)
            .map(|(guid, _)| guid.clone())
            .collect();
        completed_guids
            .into_iter()
            .filter_map(|guid| downloads.remove(&guid))
            .collect()
    }

    fn render_downloads(downloads: &[DownloadRecord]) -> String {
        let mut out = String::new();
        for d in downloads {
            if d.error.is_empty() {
                out.push_str(&format!(
                    "\n  - {} (from {}) saved to: {}",
                    d.suggested_filename, d.url, d.final_path
                ));
            } else {
                out.push_str(&format!(
                    "\n  - {} (from {}): ERROR: {}",
                    d.suggested_filename, d.url, d.error
                ));
            }
        }
        out
    }

    /// Wrap a success message, appending any downloads that completed
    /// since the last report.
    fn tool_out_with_downloads(&self, message: impl Into<String>) -> ToolOut {
        let downloads = self.take_completed_downloads();
        let message = message.into();
        if downloads.is_empty() {
            return ToolOut::text(message);
        }
        ToolOut::text(format!(
            "{message}\n\nDownloads completed:{}",
            Self::render_downloads(&downloads)
        ))
    }

    // ========================================================================
    // Console logs
    // ========================================================================

    fn console_tail(&self, limit: usize) -> Vec<Value> {
        let console = self.console.lock().unwrap();
        let skip = console.len().saturating_sub(limit);
        console.iter().skip(skip).cloned().collect()
    }

    fn clear_console(&self) -> usize {
        let mut console = self.console.lock().unwrap();
        let count = console.len();
        console.clear();
        count
    }

    // ========================================================================
    // Actions
    // ========================================================================

    pub async fn navigate(self: &Arc<Self>, input: NavigateInput) -> ToolOut {
        if is_port80(&input.url) {
            return ToolOut::error(
                "port 80 is not the port you're looking for--port 80 is the main confab server",
            );
        }

        let session = match self.get_session().await {
            Ok(session) => session,
            Err(e) => return ToolOut::error(e.to_string()),
        };
        let timeout = parse_timeout(input.timeout.as_deref());

        match tokio::time::timeout(timeout, session.navigate(&input.url)).await {
            Ok(Ok(())) => self.tool_out_with_downloads("done"),
            Ok(Err(e)) => {
                let text = e.to_string();
                // Navigation to download URLs aborts, but the download
                // may have succeeded. Give the events a moment, then
                // report downloads instead of the abort.
                if text.contains("net::ERR_ABORTED") {
                    tokio::time::sleep(DOWNLOAD_SETTLE).await;
                    let downloads = self.take_completed_downloads();
                    if !downloads.is_empty() {
                        return ToolOut::text(format!(
                            "Navigation triggered download(s):{}",
                            Self::render_downloads(&downloads)
                        ));
                    }
                }
                ToolOut::error(text)
            }
            Err(_) => ToolOut::error(format!("navigation timed out after {timeout:?}")),
        }
    }

    pub async fn eval(self: &Arc<Self>, input: EvalInput) -> ToolOut {
        let session = match self.get_session().await {
            Ok(session) => session,
            Err(e) => return ToolOut::error(e.to_string()),
        };
        let timeout = parse_timeout(input.timeout.as_deref());
        let await_promise = input.await_promise.unwrap_or(true);

        let result = match tokio::time::timeout(
            timeout,
            session.evaluate(&input.expression, await_promise),
        )
        .await
        {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return ToolOut::error(e.to_string()),
            Err(_) => return ToolOut::error(format!("eval timed out after {timeout:?}")),
        };

        let response = match serde_json::to_string(&result) {
            Ok(response) => response,
            Err(e) => return ToolOut::error(format!("failed to serialize result: {e}")),
        };

        if response.len() > SPILL_THRESHOLD {
            let filename = format!("js_result_{}.json", short_suffix());
            let path = self.config.console_logs_dir.join(filename);
            if let Err(e) = std::fs::write(&path, &response) {
                return ToolOut::error(format!("failed to write JS result to file: {e}"));
            }
            return self.tool_out_with_downloads(format!(
                "JavaScript result ({} bytes) written to: {}\nUse `cat {}` to view the full content.",
                response.len(),
                path.display(),
                path.display()
            ));
        }

        self.tool_out_with_downloads(format!("<javascript_result>{response}</javascript_result>"))
    }

    pub async fn resize(self: &Arc<Self>, input: ResizeInput) -> ToolOut {
        if input.width <= 0 || input.height <= 0 {
            return ToolOut::error("invalid dimensions: width and height must be positive");
        }

        let session = match self.get_session().await {
            Ok(session) => session,
            Err(e) => return ToolOut::error(e.to_string()),
        };
        let timeout = parse_timeout(input.timeout.as_deref());

        match tokio::time::timeout(
            timeout,
            session.set_viewport(input.width as u32, input.height as u32),
        )
        .await
        {
            Ok(Ok(())) => ToolOut::text("done"),
            Ok(Err(e)) => ToolOut::error(e.to_string()),
            Err(_) => ToolOut::error(format!("resize timed out after {timeout:?}")),
        }
    }

    pub async fn screenshot(self: &Arc<Self>, input: ScreenshotInput) -> ToolOut {
        let session = match self.get_session().await {
            Ok(session) => session,
            Err(e) => return ToolOut::error(e.to_string()),
        };
        let timeout = parse_timeout(input.timeout.as_deref());
        let selector = input.selector.as_deref().unwrap_or("").to_string();

        let capture = async {
            if selector.is_empty() {
                session.capture_screenshot(None).await
            } else {
                session.wait_ready(&selector).await?;
                let clip = session.element_box(&selector).await?;
                session.capture_screenshot(Some(clip)).await
            }
        };
        let png = match tokio::time::timeout(timeout, capture).await {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => return ToolOut::error(e.to_string()),
            Err(_) => return ToolOut::error(format!("screenshot timed out after {timeout:?}")),
        };

        let id = Uuid::new_v4().to_string();
        let path = self.config.screenshot_dir.join(format!("{id}.png"));
        if let Err(e) = std::fs::write(&path, &png) {
            return ToolOut::error(format!("failed to save screenshot: {e}"));
        }

        let (image_data, media_type, resized) = if self.config.max_image_dimension > 0 {
            match imageutil::resize_image(&png, "image/png", self.config.max_image_dimension).await
            {
                Ok(resized) => resized,
                Err(e) => return ToolOut::error(format!("failed to resize screenshot: {e}")),
            }
        } else {
            (png, "image/png".to_string(), false)
        };

        let mut description = format!("Screenshot taken (saved as {})", path.display());
        if resized {
            description.push_str(" [resized]");
        }

        let display = serde_json::json!({
            "type": "screenshot",
            "id": id,
            "url": format!("/api/read?path={}", urlencode(&path.to_string_lossy())),
            "path": path.to_string_lossy(),
            "selector": selector,
        });

        ToolOut {
            content: vec![
                ToolResultContent::text(description),
                ToolResultContent::Media {
                    media_type,
                    data: base64::engine::general_purpose::STANDARD.encode(&image_data),
                },
            ],
            display: Some(display),
            is_error: false,
        }
    }

    pub async fn console_logs(self: &Arc<Self>, input: ConsoleLogsInput) -> ToolOut {
        if let Err(e) = self.get_session().await {
            return ToolOut::error(e.to_string());
        }

        let limit = match input.limit {
            Some(limit) if limit > 0 => limit,
            _ => MAX_CONSOLE_LOGS,
        };
        let logs = self.console_tail(limit);

        let log_data = match serde_json::to_string_pretty(&logs) {
            Ok(data) => data,
            Err(e) => return ToolOut::error(format!("failed to serialize logs: {e}")),
        };

        if log_data.len() > SPILL_THRESHOLD {
            let filename = format!("console_logs_{}.json", short_suffix());
            let path = self.config.console_logs_dir.join(filename);
            if let Err(e) = std::fs::write(&path, &log_data) {
                return ToolOut::error(format!("failed to write console logs to file: {e}"));
            }
            return ToolOut::text(format!(
                "Retrieved {} console log entries ({} bytes).\nOutput written to: {}\nUse `cat {}` to view the full content.",
                logs.len(),
                log_data.len(),
                path.display(),
                path.display()
            ));
        }

        if logs.is_empty() {
            return ToolOut::text(format!(
                "Retrieved {} console log entries:\n\nNo console logs captured.",
                logs.len()
            ));
        }
        ToolOut::text(format!(
            "Retrieved {} console log entries:\n\n{log_data}",
            logs.len()
        ))
    }

    pub async fn clear_console_logs(self: &Arc<Self>) -> ToolOut {
        if let Err(e) = self.get_session().await {
            return ToolOut::error(e.to_string());
        }
        let count = self.clear_console();
        ToolOut::text(format!("Cleared {count} console log entries."))
    }

    pub async fn read_image(&self, input: ReadImageInput) -> ToolOut {
        let path = Path::new(&input.path);
        if !path.exists() {
            return ToolOut::error(format!("image file not found: {}", input.path));
        }

        let mut data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => return ToolOut::error(format!("failed to read image file: {e}")),
        };

        let mut converted = false;
        if imageutil::is_heic(&data) {
            data = match imageutil::convert_heic_to_png(&data).await {
                Ok(png) => png,
                Err(e) => return ToolOut::error(format!("failed to convert HEIC image: {e}")),
            };
            converted = true;
        }

        let Some(media_type) = imageutil::detect_image_type(&data) else {
            return ToolOut::error("file is not an image");
        };

        let (data, media_type, resized) = if self.config.max_image_dimension > 0 {
            match imageutil::resize_image(&data, media_type, self.config.max_image_dimension).await
            {
                Ok(resized) => resized,
                Err(e) => return ToolOut::error(format!("failed to resize image: {e}")),
            }
        } else {
            (data, media_type.to_string(), false)
        };

        let mut description = format!("Image from {} (type: {media_type})", input.path);
        if converted {
            description.push_str(" [converted from HEIC]");
        }
        if resized {
            description.push_str(" [resized]");
        }

        ToolOut {
            content: vec![
                ToolResultContent::text(description),
                ToolResultContent::Media {
                    media_type,
                    data: base64::engine::general_purpose::STANDARD.encode(&data),
                },
            ],
            display: None,
            is_error: false,
        }
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn push_console_log(console: &Mutex<VecDeque<Value>>, params: Value) {
    let mut console = console.lock().unwrap();
    console.push_back(params);
    while console.len() > MAX_CONSOLE_LOGS {
        console.pop_front();
    }
}

fn handle_download_will_begin(downloads: &Mutex<HashMap<String, DownloadRecord>>, params: &Value) {
    let guid = params
        .get("guid")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if guid.is_empty() {
        return;
    }
    let record = DownloadRecord {
        guid: guid.clone(),
        url: params
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        suggested_filename: params
            .get("suggestedFilename")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        ..Default::default()
    };
    downloads.lock().unwrap().insert(guid, record);
}

async fn handle_download_progress(
    downloads: &Mutex<HashMap<String, DownloadRecord>>,
    download_dir: &Path,
    params: &Value,
) {
    let guid = params
        .get("guid")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if guid.is_empty() {
        return;
    }
    let state = params
        .get("state")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    // Download may have started before tracking began.
    let suggested = {
        let mut map = downloads.lock().unwrap();
        let record = map.entry(guid.clone()).or_insert_with(|| DownloadRecord {
            guid: guid.clone(),
            ..Default::default()
        });
        record.suggested_filename.clone()
    };

    match state.as_str() {
        "completed" => {
            // The engine writes the file under its GUID; rename it to
            // the suggested name with a random suffix. The file may
            // still be flushing, hence the retries.
            let guid_path = download_dir.join(&guid);
            let final_name = generate_download_filename(&suggested);
            let final_path = download_dir.join(&final_name);
            let mut renamed = false;
            for _ in 0..RENAME_RETRIES {
                if tokio::fs::rename(&guid_path, &final_path).await.is_ok() {
                    renamed = true;
                    break;
                }
                tokio::time::sleep(RENAME_RETRY_DELAY).await;
            }

            let mut map = downloads.lock().unwrap();
            if let Some(record) = map.get_mut(&guid) {
                record.completed = true;
                record.final_path = if renamed {
                    final_path.to_string_lossy().to_string()
                } else if let Some(file_path) =
                    params.get("filePath").and_then(|v| v.as_str())
                {
                    file_path.to_string()
                } else {
                    guid_path.to_string_lossy().to_string()
                };
            }
        }
        "canceled" => {
            let mut map = downloads.lock().unwrap();
            if let Some(record) = map.get_mut(&guid) {
                record.completed = true;
                record.error = "download canceled".to_string();
            }
        }
        _ => {}
    }
}

/// Build `<base>_<8hex><ext>` from a suggested filename.
fn generate_download_filename(suggested: &str) -> String {
    let suggested = if suggested.is_empty() {
        "download"
    } else {
        suggested
    };
    let (base, ext) = match suggested.rfind('.') {
        Some(dot) if dot > 0 => suggested.split_at(dot),
        _ => (suggested, ""),
    };
    format!("{base}_{}{ext}", short_suffix())
}

//! Headless browser tool backed by a Chrome/Chromium binary.
//!
//! Each call launches a fresh browser process (`--dump-dom` for text,
//! `--screenshot` for images), so no browser state leaks between steps. The
//! process is killed if the call is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tokio::process::Command;
use uuid::Uuid;

use super::web::extract_text_from_html;
use super::{Tool, ToolCapabilities, ToolContext, ToolError, ToolOutput};
use crate::config::BrowserConfig;
use crate::util::find_on_path;

const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

const WINDOW_SIZE: &str = "1280,800";

/// Chrome network errors that point at the proxy.
const PROXY_ERRORS: &[&str] = &[
    "ERR_PROXY_CONNECTION_FAILED",
    "ERR_TUNNEL_CONNECTION_FAILED",
    "ERR_PROXY_AUTH_UNSUPPORTED",
    "ERR_PROXY_AUTH_REQUESTED",
    "ERR_NO_SUPPORTED_PROXIES",
];

/// Screenshot file removed when dropped.
struct TempImage {
    path: PathBuf,
}

impl Drop for TempImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Browser {
    binary: PathBuf,
    config: BrowserConfig,
}

impl Browser {
    pub fn new(binary: PathBuf, config: BrowserConfig) -> Self {
        if !config.headless {
            tracing::warn!("browser.headless = false: one-shot capture still runs headless");
        }
        Self { binary, config }
    }

    /// Find a Chrome binary: the configured path, else the first one on PATH.
    pub fn locate(config: &BrowserConfig) -> Option<PathBuf> {
        match &config.chrome_path {
            Some(path) => path.is_file().then(|| path.clone()),
            None => CHROME_CANDIDATES.iter().find_map(|c| find_on_path(c)),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "--headless=new".to_string(),
            "--disable-gpu".to_string(),
            "--no-first-run".to_string(),
            "--hide-scrollbars".to_string(),
            format!("--window-size={}", WINDOW_SIZE),
            format!("--timeout={}", self.config.timeout.saturating_mul(1000)),
        ];
        if self.config.disable_security {
            args.push("--no-sandbox".to_string());
            args.push("--disable-web-security".to_string());
            args.push("--ignore-certificate-errors".to_string());
        }
        if let Some(user_agent) = &self.config.user_agent {
            args.push(format!("--user-agent={}", user_agent));
        }
        if let Some(proxy) = &self.config.proxy {
            args.push(format!("--proxy-server={}", proxy_server_arg(proxy)));
        }
        args
    }

    async fn run(&self, args: Vec<String>) -> anyhow::Result<(String, String)> {
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ToolError::ExecutionError(format!(
                    "Failed to launch browser {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if let Some(code) = PROXY_ERRORS
            .iter()
            .find(|code| stdout.contains(*code) || stderr.contains(*code))
        {
            return Err(ToolError::ExecutionError(format!("Proxy failure: {}", code)).into());
        }
        if !output.status.success() {
            return Err(ToolError::ExecutionError(format!(
                "Browser exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or_default()
            ))
            .into());
        }
        Ok((stdout, stderr))
    }

    async fn get_text(&self, url: &str) -> anyhow::Result<ToolOutput> {
        let mut args = self.base_args();
        args.push("--dump-dom".to_string());
        args.push(url.to_string());
        let (dom, _) = self.run(args).await?;
        if let Some(pos) = dom.find("net::ERR_") {
            let code: String = dom[pos..]
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != '<')
                .collect();
            return Err(ToolError::ExecutionError(format!("Navigation failed: {}", code)).into());
        }
        Ok(ToolOutput::text(extract_text_from_html(&dom)).with_structured(json!({
            "url": url,
            "html_bytes": dom.len(),
        })))
    }

    async fn screenshot(&self, url: &str) -> anyhow::Result<ToolOutput> {
        let shot = TempImage {
            path: std::env::temp_dir().join(format!("magic-agent-shot-{}.png", Uuid::new_v4())),
        };
        let mut args = self.base_args();
        args.push(format!("--screenshot={}", shot.path.display()));
        args.push(url.to_string());
        self.run(args).await?;

        let bytes = tokio::fs::read(&shot.path).await.map_err(|e| {
            ToolError::ExecutionError(format!("Browser produced no screenshot: {}", e))
        })?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Ok(ToolOutput::text(format!(
            "Screenshot of {} ({} bytes, {} window)",
            url,
            bytes.len(),
            WINDOW_SIZE
        ))
        .with_image(format!("data:image/png;base64,{}", encoded)))
    }
}

fn proxy_server_arg(proxy: &crate::config::ProxyConfig) -> String {
    let Some(username) = &proxy.username else {
        return proxy.server.clone();
    };
    match url::Url::parse(&proxy.server) {
        Ok(mut parsed) => {
            if parsed.set_username(username).is_ok() {
                let _ = parsed.set_password(proxy.password.as_deref());
            }
            parsed.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => proxy.server.clone(),
    }
}

#[async_trait]
impl Tool for Browser {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Open a web page in a headless browser. 'get_text' returns the rendered page text (after JavaScript runs); 'screenshot' returns an image of the page."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["get_text", "screenshot"],
                    "description": "What to capture"
                },
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to open"
                }
            },
            "required": ["action", "url"]
        })
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities {
            requires_network: true,
            requires_sandbox: false,
            idempotent: true,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout))
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
        let url = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'url' argument"))?;
        let parsed = url::Url::parse(url)
            .map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", url, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("Unsupported URL scheme '{}'", parsed.scheme());
        }

        match args["action"].as_str() {
            Some("get_text") => self.get_text(parsed.as_str()).await,
            Some("screenshot") => self.screenshot(parsed.as_str()).await,
            other => anyhow::bail!("Unknown browser action: {:?}", other),
        }
    }
}

//! Chromium implementation of the browser backend.
//!
//! Wraps chromiumoxide: executable discovery, launch configuration with
//! stealth arguments, and the CDP handler task that drives the websocket
//! connection for the lifetime of the instance.

use std::any::Any;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::backend::{BackendBrowser, BackendPage, BrowserBackend, LaunchOptions};
use crate::utils::constants::BROWSER_CLOSE_TIMEOUT;

const CHROME_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Find a Chrome/Chromium executable on the system.
///
/// `CHROMIUM_PATH` overrides everything; then platform-typical install
/// locations; then `which` on Unix.
pub fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };
    for path in paths {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("found browser at: {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output()
                && output.status.success()
            {
                let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path_str.is_empty() {
                    return Ok(PathBuf::from(path_str));
                }
            }
        }
    }

    Err(anyhow::anyhow!("Chrome/Chromium executable not found"))
}

/// Backend that launches local Chromium processes over CDP.
#[derive(Debug, Default)]
pub struct ChromiumBackend;

impl ChromiumBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn BackendBrowser>> {
        let chrome_path = find_browser_executable()?;

        let user_data_dir = match options.user_data_dir {
            Some(dir) => dir,
            None => std::env::temp_dir().join(format!(
                "dragnet_chrome_{}",
                Uuid::new_v4().simple()
            )),
        };
        std::fs::create_dir_all(&user_data_dir)
            .context("failed to create user data directory")?;

        let mut config_builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_secs(30))
            .window_size(1920, 1080)
            .user_data_dir(user_data_dir.clone())
            .chrome_executable(chrome_path);

        if options.headless {
            config_builder = config_builder.headless_mode(HeadlessMode::default());
        } else {
            config_builder = config_builder.with_head();
        }

        config_builder = config_builder
            .arg(format!("--user-agent={CHROME_USER_AGENT}"))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--disable-background-networking")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--disable-ipc-flooding-protection")
            .arg("--disable-prompt-on-repost")
            .arg("--metrics-recording-only")
            .arg("--password-store=basic")
            .arg("--use-mock-keychain")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--mute-audio");

        if let Some(proxy) = &options.proxy_url {
            config_builder = config_builder.arg(format!("--proxy-server={proxy}"));
        }
        if let Some(cache_dir) = &options.disk_cache_dir {
            config_builder =
                config_builder.arg(format!("--disk-cache-dir={}", cache_dir.display()));
        }
        for arg in &options.extra_args {
            config_builder = config_builder.arg(arg);
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("failed to launch browser")?;

        // The handler stream drives the CDP websocket; it must be polled
        // for the whole lifetime of the browser
        let handler_task = task::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let message = e.to_string();
                    // Chrome emits CDP events chromiumoxide cannot decode;
                    // those are noise, not failures
                    let benign = message
                        .contains("data did not match any variant of untagged enum Message")
                        || message.contains("Failed to deserialize WS response");
                    if !benign {
                        error!("browser handler error: {message}");
                    }
                }
            }
        });

        Ok(Box::new(ChromiumBrowser {
            browser: Mutex::new(browser),
            handler: Mutex::new(Some(handler_task)),
        }))
    }
}

/// One chromium process and its CDP handler task.
pub struct ChromiumBrowser {
    browser: Mutex<Browser>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BackendBrowser for ChromiumBrowser {
    async fn new_page(&self) -> Result<Box<dyn BackendPage>> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .context("failed to open page")?;
        Ok(Box::new(ChromiumPage {
            id: format!("page_{}", Uuid::new_v4().simple()),
            page,
            closed: AtomicBool::new(false),
        }))
    }

    async fn is_healthy(&self) -> bool {
        self.browser.lock().await.version().await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        let mut browser = self.browser.lock().await;
        tokio::time::timeout(BROWSER_CLOSE_TIMEOUT, async {
            browser.close().await?;
            browser.wait().await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|_| anyhow::anyhow!("browser close timed out"))??;

        if let Some(handler) = self.handler.lock().await.take() {
            handler.abort();
        }
        Ok(())
    }

    async fn kill(&self) {
        if let Some(handler) = self.handler.lock().await.take() {
            handler.abort();
        }
        // With the handler gone the websocket drops; give the process one
        // short chance at a clean exit and move on either way
        let mut browser = self.browser.lock().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), browser.close()).await;
    }
}

/// One chromium tab.
pub struct ChromiumPage {
    id: String,
    page: chromiumoxide::Page,
    closed: AtomicBool,
}

impl ChromiumPage {
    /// The underlying CDP page, for user handlers to navigate with.
    #[must_use]
    pub fn cdp_page(&self) -> &chromiumoxide::Page {
        &self.page
    }
}

#[async_trait]
impl BackendPage for ChromiumPage {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.page
            .clone()
            .close()
            .await
            .context("failed to close page")?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

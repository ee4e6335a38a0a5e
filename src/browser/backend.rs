//! Backend abstraction between the pool and a concrete browser library.
//!
//! The pool manages lifecycle (launch, retire, kill) purely through these
//! traits; the chromium implementation lives in [`super::chromium`] and
//! test suites substitute stubs. Crawler variants are composition, not
//! inheritance: the engine takes whatever backend it is handed.

use std::any::Any;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

/// Options for launching one browser instance.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Proxy the instance is bound to for its whole lifetime
    pub proxy_url: Option<String>,
    /// Profile directory; a unique temp dir when absent
    pub user_data_dir: Option<PathBuf>,
    /// Disk cache directory, used by the pool's cache recycling
    pub disk_cache_dir: Option<PathBuf>,
    /// Extra command-line arguments appended verbatim
    pub extra_args: Vec<String>,
}

/// Launches browser instances.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn launch(&self, options: LaunchOptions) -> Result<Box<dyn BackendBrowser>>;
}

/// One live browser process.
#[async_trait]
pub trait BackendBrowser: Send + Sync {
    /// Open a fresh page (tab).
    async fn new_page(&self) -> Result<Box<dyn BackendPage>>;

    /// Cheap liveness probe (a version ping on CDP backends).
    async fn is_healthy(&self) -> bool;

    /// Ask the process to shut down cleanly.
    async fn close(&self) -> Result<()>;

    /// Terminate without waiting for a clean shutdown.
    async fn kill(&self);
}

/// One page (tab) belonging to a backend browser.
#[async_trait]
pub trait BackendPage: Send + Sync {
    /// Stable identifier of this page within its pool.
    fn id(&self) -> &str;

    /// Whether the page has been closed (by us or by the browser).
    fn is_closed(&self) -> bool;

    /// Close the page. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Concrete-type escape hatch for user handlers that need the
    /// underlying page object (e.g. the chromiumoxide `Page`).
    fn as_any(&self) -> &dyn Any;
}

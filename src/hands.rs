use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dom;
use crate::error::ProviderFault;
use crate::types::StateSnapshot;

/// The operations the executor may perform against the controlled target.
///
/// Every method takes `&mut self`: a provider handle is single-owner and
/// never driven by two actions at once.
#[async_trait]
pub trait CapabilityProvider: Send {
    async fn navigate_to(&mut self, url: &str) -> Result<(), ProviderFault>;

    async fn click_element(&mut self, selector: &str) -> Result<(), ProviderFault>;

    async fn fill_element(&mut self, selector: &str, value: &str) -> Result<(), ProviderFault>;

    async fn read_text(&mut self, selector: &str) -> Result<String, ProviderFault>;

    async fn capture_image(&mut self, path: &Path) -> Result<(), ProviderFault>;

    async fn current_location_summary(&mut self) -> Result<StateSnapshot, ProviderFault>;
}

/// How to obtain a Chrome instance.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Attach to an already-running Chrome instead of launching one.
    pub debug_url: Option<String>,
    /// Attach the interactive-element outline to every snapshot.
    pub include_outline: bool,
    pub window_size: (u32, u32),
    /// Driver-side deadline for element lookups and navigation waits.
    pub element_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            debug_url: None,
            include_outline: true,
            window_size: (1920, 1080),
            element_timeout: Duration::from_secs(20),
        }
    }
}

/// A Chrome browser plus the tab all actions run against.
///
/// Created by [`ChromeSession::acquire`] and owned by whoever drives the
/// controller; dropping it (or calling [`ChromeSession::release`]) closes
/// the browser if this process launched it.
pub struct ChromeSession {
    _browser: Browser,
    tab: Exclusive<Tab>,
    include_outline: bool,
}

/// A blocking resource driven from async code one operation at a time.
///
/// A caller that stops waiting (an executor timeout) does not stop the
/// blocking call already running. The next operation queues behind it
/// instead of driving the resource concurrently.
pub struct Exclusive<R> {
    resource: Arc<R>,
    turn: Arc<Mutex<()>>,
}

impl<R: Send + Sync + 'static> Exclusive<R> {
    pub fn new(resource: Arc<R>) -> Self {
        Self {
            resource,
            turn: Arc::new(Mutex::new(())),
        }
    }

    /// Run a blocking operation off the async runtime, after every earlier
    /// one has finished.
    pub async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, ProviderFault>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<R>) -> anyhow::Result<T> + Send + 'static,
    {
        let resource = self.resource.clone();
        let turn = self.turn.clone();
        let call = tokio::task::spawn_blocking(move || {
            let _turn = turn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&resource)
        });
        match call.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(op, error = %format!("{e:#}"), "tab operation failed");
                Err(classify_fault(&e))
            }
            Err(join) => Err(ProviderFault::Unavailable(format!("{op} aborted: {join}"))),
        }
    }
}

impl ChromeSession {
    /// Attach to or launch Chrome. Blocks; call from `spawn_blocking`.
    pub fn acquire(config: &BrowserConfig) -> anyhow::Result<Self> {
        if let Some(ref url) = config.debug_url {
            info!(%url, "attaching to running Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .map_err(|_| anyhow::anyhow!("Chrome tab list lock poisoned"))?
                        .first()
                        .cloned();
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    tab.set_default_timeout(config.element_timeout);
                    return Ok(Self {
                        _browser: browser,
                        tab: Exclusive::new(tab),
                        include_outline: config.include_outline,
                    });
                }
                Err(e) => warn!(error = %e, "could not attach, launching a new Chrome"),
            }
        }

        let options = LaunchOptions {
            headless: config.headless,
            sandbox: false,
            window_size: Some(config.window_size),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-dev-shm-usage"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless = config.headless, "launching Chrome");
        let browser = Browser::new(options)
            .map_err(|e| anyhow::anyhow!("Browser launch failed: {e}"))?;
        let tab = browser.new_tab()?;
        tab.set_default_timeout(config.element_timeout);
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");

        Ok(Self {
            _browser: browser,
            tab: Exclusive::new(tab),
            include_outline: config.include_outline,
        })
    }

    pub fn release(self) {
        debug!("releasing Chrome session");
        drop(self);
    }

    async fn on_tab<T, F>(&self, op: &'static str, f: F) -> Result<T, ProviderFault>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Tab>) -> anyhow::Result<T> + Send + 'static,
    {
        self.tab.run(op, f).await
    }
}

#[async_trait]
impl CapabilityProvider for ChromeSession {
    async fn navigate_to(&mut self, url: &str) -> Result<(), ProviderFault> {
        let url = url.to_string();
        self.on_tab("navigate", move |tab| {
            tab.navigate_to(&url)?.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn click_element(&mut self, selector: &str) -> Result<(), ProviderFault> {
        let selector = selector.to_string();
        self.on_tab("click", move |tab| {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn fill_element(&mut self, selector: &str, value: &str) -> Result<(), ProviderFault> {
        let selector = selector.to_string();
        let value = value.to_string();
        self.on_tab("fill", move |tab| {
            tab.find_element(&selector)?.click()?;
            let js_sel = serde_json::to_string(&selector)?;
            tab.evaluate(
                &format!("(el => {{ if (el) el.value = ''; }})(document.querySelector({js_sel}))"),
                false,
            )?;
            tab.type_str(&value)?;
            Ok(())
        })
        .await
    }

    async fn read_text(&mut self, selector: &str) -> Result<String, ProviderFault> {
        let selector = selector.to_string();
        self.on_tab("read_text", move |tab| {
            tab.find_element(&selector)?.get_inner_text()
        })
        .await
    }

    async fn capture_image(&mut self, path: &Path) -> Result<(), ProviderFault> {
        let path: PathBuf = path.to_path_buf();
        self.on_tab("screenshot", move |tab| {
            let png = tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, png)?;
            info!(path = %path.display(), "screenshot saved");
            Ok(())
        })
        .await
    }

    async fn current_location_summary(&mut self) -> Result<StateSnapshot, ProviderFault> {
        let include_outline = self.include_outline;
        self.on_tab("snapshot", move |tab| {
            let outline = if include_outline {
                Some(dom::capture_outline(tab)?).filter(|o| !o.is_empty())
            } else {
                None
            };
            Ok(StateSnapshot {
                url: tab.get_url(),
                title: dom::page_title(tab)?,
                content_length: dom::content_length(tab)?,
                outline,
            })
        })
        .await
    }
}

/// Sort a driver error into the fault categories the executor understands.
///
/// The driver reports everything as `anyhow::Error`, so this goes by message.
pub fn classify_fault(err: &anyhow::Error) -> ProviderFault {
    let message = format!("{err:#}");
    let lower = message.to_ascii_lowercase();
    if lower.contains("no element")
        || lower.contains("could not find")
        || lower.contains("not found")
    {
        ProviderFault::ElementNotFound(message)
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("never came")
    {
        ProviderFault::Timeout(message)
    } else if lower.contains("connection is closed")
        || lower.contains("connection closed")
        || lower.contains("disconnected")
        || lower.contains("closed channel")
    {
        ProviderFault::Unavailable(message)
    } else {
        ProviderFault::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_are_classified() {
        assert!(matches!(
            classify_fault(&anyhow::anyhow!("Could not find node with given id")),
            ProviderFault::ElementNotFound(_)
        ));
        assert!(matches!(
            classify_fault(&anyhow::anyhow!("The event waited for never came")),
            ProviderFault::Timeout(_)
        ));
        assert!(matches!(
            classify_fault(&anyhow::anyhow!(
                "Unable to make method calls because underlying connection is closed"
            )),
            ProviderFault::Unavailable(_)
        ));
        assert!(matches!(
            classify_fault(&anyhow::anyhow!("Uncaught TypeError")),
            ProviderFault::Other(_)
        ));
    }

    #[derive(Default)]
    struct Journal(Mutex<Vec<&'static str>>);

    impl Journal {
        fn note(&self, entry: &'static str) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn abandoned_operation_finishes_before_the_next_starts() {
        let journal = Arc::new(Journal::default());
        let lane = Exclusive::new(journal.clone());

        let mut slow = Box::pin(lane.run("slow", |j: &Arc<Journal>| {
            j.note("slow start");
            std::thread::sleep(Duration::from_millis(200));
            j.note("slow end");
            Ok(())
        }));
        while !journal.entries().contains(&"slow start") {
            let _ = tokio::time::timeout(Duration::from_millis(5), &mut slow).await;
        }
        drop(slow);

        lane.run("next", |j: &Arc<Journal>| {
            j.note("next");
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(journal.entries(), vec!["slow start", "slow end", "next"]);
    }

    #[tokio::test]
    async fn driver_errors_come_back_classified() {
        let lane = Exclusive::new(Arc::new(()));
        let fault = lane
            .run("click", |_: &Arc<()>| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("Could not find node with given id"))
            })
            .await
            .unwrap_err();
        assert!(matches!(fault, ProviderFault::ElementNotFound(_)));
    }

    #[test]
    fn default_config_launches_headless_with_outline() {
        let config = BrowserConfig::default();
        assert!(config.headless);
        assert!(config.include_outline);
        assert!(config.debug_url.is_none());
    }
}

use clap::Parser;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use crate::brain::{CompletionOptions, DEFAULT_MODEL, DEFAULT_OLLAMA_URL};
use crate::controller::ControllerConfig;
use crate::executor::ExecutorConfig;
use crate::hands::BrowserConfig;

/// Browser agent serving the task API.
#[derive(Debug, Clone, Parser)]
#[command(name = "agent", version)]
pub struct AgentArgs {
    #[arg(long, env = "OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub ollama_url: String,

    #[arg(long, env = "WEBPILOT_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, default_value_t = 0.7)]
    pub temperature: f32,

    #[arg(long, default_value_t = 120)]
    pub inference_timeout_secs: u64,

    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Run Chrome without a window.
    #[arg(long)]
    pub headless: bool,

    /// Attach to a Chrome already listening on this debugging URL.
    #[arg(long, env = "CHROME_DEBUG_URL")]
    pub chrome_debug_url: Option<String>,

    /// Iteration bound for autonomous runs that do not set one.
    #[arg(long, default_value = "10")]
    pub max_iterations: NonZeroU32,

    #[arg(long, default_value_t = 1000)]
    pub iteration_delay_ms: u64,

    #[arg(long, default_value_t = 30)]
    pub action_timeout_secs: u64,

    /// Leave the interactive-element outline out of snapshots.
    #[arg(long)]
    pub no_outline: bool,
}

impl AgentArgs {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            iteration_delay: Duration::from_millis(self.iteration_delay_ms),
            inference_timeout: self.inference_timeout(),
            completion: CompletionOptions {
                temperature: self.temperature,
                ..CompletionOptions::default()
            },
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            ..ExecutorConfig::default()
        }
    }

    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            headless: self.headless,
            debug_url: self.chrome_debug_url.clone(),
            include_outline: !self.no_outline,
            // Leave the driver room to report its own timeout first.
            element_timeout: Duration::from_secs(self.action_timeout_secs.saturating_sub(1).max(1)),
            ..BrowserConfig::default()
        }
    }
}

/// Native-messaging host bridging a browser extension to Ollama.
#[derive(Debug, Clone, Parser)]
#[command(name = "native_host", version)]
pub struct HostArgs {
    #[arg(long, env = "OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub ollama_url: String,

    #[arg(long, env = "WEBPILOT_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, default_value_t = 120)]
    pub inference_timeout_secs: u64,

    /// Where to write logs; stdout is reserved for frames.
    #[arg(long, env = "WEBPILOT_HOST_LOG")]
    pub log_file: Option<PathBuf>,
}

impl HostArgs {
    pub fn log_file(&self) -> PathBuf {
        self.log_file.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("webpilot")
                .join("native_host.log")
        })
    }
}

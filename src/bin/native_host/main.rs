//! Native-messaging host. Reads length-prefixed JSON requests on stdin and
//! answers on stdout until the browser closes the pipe.

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::error;
use webpilot::config::HostArgs;
use webpilot::host::{self, HostResponse};
use webpilot::{OllamaClient, framing, logging};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = HostArgs::parse();
    let log_file = args.log_file();
    logging::init_file(&log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    let client = OllamaClient::new(
        &args.ollama_url,
        &args.model,
        std::time::Duration::from_secs(args.inference_timeout_secs),
    )?;

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    if let Err(e) = host::serve(&client, &mut stdin, &mut stdout).await {
        error!(error = %e, "host loop failed");
        let _ = framing::write_json(
            &mut stdout,
            &HostResponse::failure(format!("Host error: {e}")),
        )
        .await;
        return Err(e.into());
    }
    Ok(())
}

//! Line based host bridge for the pairing flow
//!
//! Prints the first step as a JSON line, then reads one request per line:
//! `{"step_id": "user", "user_input": {"mac": "...", "name": "..."}}`.
//! Every request is answered with one JSON line. Logs go to stderr.

use beurer_pair::*;
use clap::Parser;
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// File config entries are stored in
    #[arg(long, default_value = "beurer_entries.json")]
    store: PathBuf,
    /// Pause after reading the light state, in milliseconds
    #[arg(long, default_value_t = 500)]
    settle_ms: u64,
    /// How long the light stays toggled, in milliseconds
    #[arg(long, default_value_t = 2000)]
    flicker_ms: u64,
    /// Scan window, in seconds
    #[arg(long, default_value_t = 10)]
    scan_secs: u64,
    /// Pause after each power command, in milliseconds
    #[arg(long, default_value_t = 100)]
    command_ms: u64,
}

#[derive(Debug, Deserialize)]
struct StepRequest {
    step_id: String,
    #[serde(default)]
    user_input: Option<UserInput>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Reply<'a> {
    Result(&'a FlowResult),
    Error {
        #[serde(rename = "type")]
        kind: &'static str,
        message: String,
    },
}

impl Reply<'_> {
    fn error(message: impl ToString) -> Self {
        Reply::Error {
            kind: "error",
            message: message.to_string(),
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply<'_>) -> Result<()> {
    let mut line = serde_json::to_string(reply)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Answers step requests read from `reader` until the flow finishes
///
/// A created entry that cannot be stored is reported on `writer` and returned
/// as an error.
async fn serve<R, W>(
    flow: &mut BeurerFlowHandler,
    store: &EntryStore,
    reader: R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first = flow.step(STEP_USER, None).await?;
    send(writer, &Reply::Result(&first)).await?;

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: StepRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                send(writer, &Reply::error(format!("Invalid request: {e}"))).await?;
                continue;
            }
        };
        debug!("Request for step {}", request.step_id);

        let result = match flow.step(&request.step_id, request.user_input).await {
            Ok(result) => result,
            Err(e) => {
                error!("Step {} failed: {}", request.step_id, e);
                send(writer, &Reply::error(&e)).await?;
                continue;
            }
        };

        if let Some(entry) = ConfigEntry::from_result(&result) {
            if let Err(e) = store.add(entry) {
                error!("Could not store entry: {}", e);
                send(writer, &Reply::error(&e)).await?;
                return Err(e.into());
            }
        }
        send(writer, &Reply::Result(&result)).await?;

        if !matches!(result, FlowResult::Form { .. }) {
            info!("Flow finished");
            break;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("beurer_pair=info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    let config = FlowConfig::from_millis(cli.settle_ms, cli.flicker_ms, cli.scan_secs)
        .with_command_delay(cli.command_ms);
    let store = EntryStore::open(&cli.store)?;
    let client = BleClient::new(config).await?;
    let mut flow = BeurerFlowHandler::new(Box::new(client), store.current_ids(), config);

    serve(
        &mut flow,
        &store,
        BufReader::new(io::stdin()),
        &mut io::stdout(),
    )
    .await
}

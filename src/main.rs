use beurer_pair::flow::{CONF_FLICKER, CONF_MAC, CONF_NAME, CONF_RETRY};
use beurer_pair::*;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug)]
struct Options {
    /// File config entries are stored in
    #[arg(long, global = true, default_value = "beurer_entries.json")]
    store: PathBuf,
    /// Pause after reading the light state, in milliseconds
    #[arg(long, global = true, default_value_t = 500)]
    settle_ms: u64,
    /// How long the light stays toggled, in milliseconds
    #[arg(long, global = true, default_value_t = 2000)]
    flicker_ms: u64,
    /// Scan window, in seconds
    #[arg(long, global = true, default_value_t = 10)]
    scan_secs: u64,
    /// Pause after each power command, in milliseconds
    #[arg(long, global = true, default_value_t = 100)]
    command_ms: u64,
}

impl Options {
    fn flow_config(&self) -> FlowConfig {
        FlowConfig::from_millis(self.settle_ms, self.flicker_ms, self.scan_secs)
            .with_command_delay(self.command_ms)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Pair a light interactively
    Setup,
    /// List nearby lights
    Scan,
    /// Flicker a light to check that it is reachable
    Flicker {
        /// MAC address of the light
        mac: String,
    },
    /// List configured lights
    Entries,
    /// Remove a configured light
    Remove {
        /// Entry id as shown by `entries`
        entry_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("beurer_pair=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let store = EntryStore::open(&cli.options.store)?;
    let config = cli.options.flow_config();

    match cli.command.unwrap_or(Commands::Setup) {
        Commands::Setup => {
            let client = BleClient::new(config).await?;
            let flow = BeurerFlowHandler::new(Box::new(client), store.current_ids(), config);
            run_setup(flow, &store).await?;
        }
        Commands::Scan => {
            let client = BleClient::new(config).await?;
            let configured = store.current_ids();
            for device in client.discover().await? {
                let marker = if configured.contains(&format_mac(&device.address)) {
                    " (configured)"
                } else {
                    ""
                };
                println!("{}  {}{}", device.address, device.name, marker);
            }
        }
        Commands::Flicker { mac } => {
            let client = BleClient::new(config).await?;
            let mut flow = BeurerFlowHandler::new(Box::new(client), Vec::new(), config);
            let mut input = UserInput::new();
            input.insert(CONF_MAC.into(), mac.clone().into());
            input.insert(CONF_NAME.into(), mac.clone().into());

            let result = flow.step(STEP_MANUAL, Some(input)).await?;
            if result.field_names().contains(&CONF_FLICKER) {
                println!("{mac} flickered");
            } else {
                return Err(eyre!("Could not reach {mac}"));
            }
        }
        Commands::Entries => {
            for entry in store.entries() {
                println!(
                    "{}  {}  {}  {}",
                    entry.entry_id,
                    entry.unique_id,
                    entry.title,
                    entry.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Remove { entry_id } => match store.remove(&entry_id)? {
            Some(entry) => println!("Removed {}", entry.title),
            None => return Err(eyre!("No entry with id {entry_id}")),
        },
    }

    Ok(())
}

/// Drives the flow on the terminal until it creates an entry or aborts
#[instrument(skip_all)]
async fn run_setup(mut flow: BeurerFlowHandler, store: &EntryStore) -> Result<()> {
    let mut result = flow.step(STEP_USER, None).await?;

    loop {
        match result {
            FlowResult::Form {
                step_id,
                data_schema,
                errors,
            } => {
                if errors.contains_key("base") {
                    println!("Could not connect to the light.");
                }
                let input = prompt_form(&step_id, &data_schema)?;
                result = flow.step(&step_id, Some(input)).await?;
            }
            created @ FlowResult::CreateEntry { .. } => {
                let entry = ConfigEntry::from_result(&created)
                    .ok_or_else(|| eyre!("Flow finished without an entry"))?;
                println!("Added {} ({})", entry.title, entry.unique_id);
                store.add(entry)?;
                info!("Setup finished");
                return Ok(());
            }
            FlowResult::Abort { reason } => {
                warn!("Setup aborted: {}", reason);
                return Err(eyre!("Setup aborted: {reason}"));
            }
        }
    }
}

/// Asks for every field of a form on stdin
fn prompt_form(step_id: &str, fields: &[FormField]) -> Result<UserInput> {
    let mut input = UserInput::new();
    for field in fields {
        let value = match &field.kind {
            FieldKind::String => prompt(&field.name)?.into(),
            FieldKind::Bool => prompt_bool(&question(step_id, &field.name))?.into(),
            FieldKind::Select { options } => prompt_select(&field.name, options)?.into(),
        };
        input.insert(field.name.clone(), value);
    }
    Ok(input)
}

fn question(step_id: &str, field: &str) -> String {
    match (step_id, field) {
        (STEP_VALIDATE, CONF_RETRY) => "Retry".to_string(),
        (STEP_VALIDATE, CONF_FLICKER) => "Did the light flicker".to_string(),
        _ => field.to_string(),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Err(eyre!("Input closed"));
    }
    Ok(line.trim().to_string())
}

fn prompt_bool(label: &str) -> Result<bool> {
    loop {
        match prompt(&format!("{label}? [y/n]"))?.to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("Please answer y or n"),
        }
    }
}

fn prompt_select(label: &str, options: &[SelectOption]) -> Result<String> {
    for (i, option) in options.iter().enumerate() {
        println!("  {}) {} [{}]", i + 1, option.label, option.value);
    }
    loop {
        let choice = prompt(label)?;
        match choice.parse::<usize>() {
            Ok(n) if (1..=options.len()).contains(&n) => return Ok(options[n - 1].value.clone()),
            _ => println!("Pick a number between 1 and {}", options.len()),
        }
    }
}

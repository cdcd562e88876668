//! Command-line tool for card terminals
//!
//! Lists readers and their cards, waits for presence changes and sends raw
//! APDUs or reader control commands through the IFD layer on top of PC/SC.

mod display;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use ecard_ifd::{
    ContextHandle, DisconnectAction, IfdService, InputApdu, WaitRequest, WaitResponse,
};
use ecard_ifd_pcsc::{PcscConfig, PcscTerminalFactory, ShareMode};
use tracing::{Level, debug};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Card terminal interface tool")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Reader presence poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    poll_interval: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Show reader and card status
    Status {
        /// Only this reader
        reader: Option<String>,
    },

    /// Show the capabilities of a reader
    Capabilities {
        /// Reader name
        reader: String,
    },

    /// Wait for a reader or card change
    Wait {
        /// Give up after this many milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Print terminal events until interrupted
    Watch {
        /// Stop after this many events
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Send command APDUs to the card in a reader
    Transmit {
        /// Reader name
        reader: String,

        /// Command APDUs (hex)
        #[arg(required = true)]
        apdus: Vec<String>,

        /// Acceptable status codes (hex), any status if omitted
        #[arg(short, long)]
        accept: Vec<String>,

        /// Connect in shared mode instead of holding a transaction
        #[arg(long)]
        shared: bool,

        /// Reset the card when done
        #[arg(long)]
        reset: bool,
    },

    /// Send a reader control command: feature tag followed by the payload (hex)
    Control {
        /// Reader name
        reader: String,

        /// Feature tag and payload (hex)
        command: String,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}

fn decode(label: &str, value: &str) -> Result<Vec<u8>> {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&cleaned).with_context(|| format!("invalid {label}: {value}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = PcscConfig::new()
        .with_share_mode(ShareMode::Shared)
        .with_poll_interval(Duration::from_millis(cli.poll_interval));
    let service = IfdService::new(Arc::new(PcscTerminalFactory::new(config)));
    let ctx = service
        .establish_context()
        .context("failed to establish the IFD context")?;
    debug!(context = %ctx, "context established");

    let result = run(&service, &ctx, cli.command);
    service.release_context(&ctx)?;
    result
}

fn run(service: &IfdService, ctx: &ContextHandle, command: Commands) -> Result<()> {
    match command {
        Commands::List => list(service, ctx),
        Commands::Status { reader } => {
            for status in service.get_status(ctx, reader.as_deref())? {
                println!("{}", display::status(&status));
            }
            Ok(())
        }
        Commands::Capabilities { reader } => {
            let capabilities = service.get_ifd_capabilities(ctx, &reader)?;
            println!("{}", display::capabilities(&reader, &capabilities));
            Ok(())
        }
        Commands::Wait { timeout } => wait(service, ctx, timeout),
        Commands::Watch { count } => watch(service, count),
        Commands::Transmit {
            reader,
            apdus,
            accept,
            shared,
            reset,
        } => transmit(service, ctx, &reader, &apdus, &accept, !shared, reset),
        Commands::Control { reader, command } => {
            let command = decode("control command", &command)?;
            let slot = service.connect(ctx, &reader, false)?;
            let result = service.control_ifd(ctx, &slot, &command);
            service.disconnect(ctx, &slot, DisconnectAction::Leave)?;
            let response = result?;
            println!("{}", hex::encode_upper(&response.response));
            if let Err(e) = response.result {
                println!("{}", display::warning(&e.to_string()));
            }
            Ok(())
        }
    }
}

fn list(service: &IfdService, ctx: &ContextHandle) -> Result<()> {
    let statuses = service.get_status(ctx, None)?;
    if statuses.is_empty() {
        println!("No readers found.");
        return Ok(());
    }

    println!("Available readers:");
    for (i, status) in statuses.iter().enumerate() {
        let presence = if status.card_available() {
            "card present"
        } else {
            "no card"
        };
        println!("{}. {} ({})", i + 1, status.name, presence);
    }
    Ok(())
}

fn wait(service: &IfdService, ctx: &ContextHandle, timeout: Option<u64>) -> Result<()> {
    let mut request = WaitRequest::new();
    if let Some(timeout) = timeout {
        request = request.with_timeout(Duration::from_millis(timeout));
    }

    match service.wait(ctx, request)? {
        WaitResponse::Changed(changes) if changes.is_empty() => {
            println!("{}", display::warning("No change before the timeout"));
        }
        WaitResponse::Changed(changes) => {
            for status in &changes {
                println!("{}", display::status(status));
            }
        }
        WaitResponse::Session(session) => bail!("unexpected asynchronous session {session}"),
    }
    Ok(())
}

fn watch(service: &IfdService, count: Option<usize>) -> Result<()> {
    let events = service.subscribe();
    println!("Watching terminal events, press Ctrl-C to stop");

    for (seen, event) in events.iter().enumerate() {
        println!("{event}");
        if count.is_some_and(|count| seen + 1 >= count) {
            break;
        }
    }
    Ok(())
}

fn transmit(
    service: &IfdService,
    ctx: &ContextHandle,
    reader: &str,
    apdus: &[String],
    accept: &[String],
    exclusive: bool,
    reset: bool,
) -> Result<()> {
    let acceptable = accept
        .iter()
        .map(|code| decode("status code", code))
        .collect::<Result<Vec<_>>>()?;
    let inputs = apdus
        .iter()
        .map(|apdu| {
            let command = decode("APDU", apdu)?;
            Ok(acceptable
                .iter()
                .fold(InputApdu::new(command), |input, code| {
                    input.with_acceptable(code.clone())
                }))
        })
        .collect::<Result<Vec<_>>>()?;

    let slot = service.connect(ctx, reader, exclusive)?;
    let result = service.transmit(ctx, &slot, &inputs);
    if exclusive {
        if let Err(e) = service.end_transaction(ctx, &slot) {
            debug!(error = %e, "ending the transaction failed");
        }
    }
    let action = if reset {
        DisconnectAction::Reset
    } else {
        DisconnectAction::Leave
    };
    service.disconnect(ctx, &slot, action)?;

    let response = result?;
    for (command, answer) in apdus.iter().zip(&response.responses) {
        println!("> {}", command.to_uppercase());
        println!("< {}", hex::encode_upper(answer));
    }
    match response.result {
        Ok(()) => println!("{}", display::success("All responses accepted")),
        Err(e) => println!("{}", display::warning(&e.to_string())),
    }
    Ok(())
}

mod error;
mod store;

use std::cell::Cell;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jitcap_shared::{DEFAULT_SEND_TIMEOUT, Message, MessageSink, PIPE_NAME};
use log::{info, warn};

pub use error::{Error, Result};
pub use store::CaptureStore;

#[derive(Parser)]
#[command(name = "jitcap")]
#[command(about = "Receive JIT-compiled code captured from a running .NET process")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for one producer, record what it sends, then write it to disk
    Listen {
        /// Endpoint name the producer connects to
        #[arg(short, long, default_value = PIPE_NAME)]
        pipe: String,
        /// Output directory for code blobs and the call-target listing
        #[arg(short, long, default_value = "jitcap_out")]
        output: PathBuf,
        /// Ask the producer for code of functions seen only through call targets
        #[arg(short, long)]
        request_missing: bool,
        /// End the session after this many messages
        #[arg(short, long)]
        max_messages: Option<usize>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Listen {
            pipe,
            output,
            request_missing,
            max_messages,
        } => match listen(&pipe, request_missing, max_messages) {
            Ok(store) => match store.write_to(&output) {
                Ok(summary) => {
                    println!("\n=== Capture Results ===\n");
                    if let Some(session) = store.session() {
                        println!(
                            "Process {} (machine 0x{:04X})",
                            session.process_id, session.process_kind
                        );
                    }
                    println!(
                        "{} code bodies, {} call targets",
                        summary.code_files, summary.target_lines
                    );
                    println!("\nSaved to: {}", output.display());
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
    }
}

/// Accept one producer and record its messages until it disconnects, or
/// until `max_messages` have arrived and the session is ended from this side.
fn listen(pipe: &str, request_missing: bool, max_messages: Option<usize>) -> Result<CaptureStore> {
    if max_messages == Some(0) {
        return Err(Error::Other("--max-messages must be at least 1".into()));
    }

    info!("waiting for a producer on {}", pipe);
    let transport = jitcap_shared::accept_one(pipe, Some(DEFAULT_SEND_TIMEOUT))?;
    info!("producer connected");

    let mut store = CaptureStore::new();
    let mut received = 0usize;
    let finished = Cell::new(false);

    transport.receive_loop(
        |header, body| {
            received += 1;

            match Message::decode(&header, &body) {
                Ok(message) => {
                    for request in store.record(message) {
                        if request_missing
                            && !transport.send(&Message::RequestFunctionCode(request))
                        {
                            warn!("request for 0x{:X} was not sent", request.function_id);
                        }
                    }
                }
                Err(e) => warn!("dropping frame of kind {}: {}", header.kind, e),
            }

            if max_messages.is_some_and(|max| received >= max) {
                info!("received {} messages, ending the session", received);
                if !transport.send(&Message::EndSession) {
                    warn!("EndSession was not sent");
                }
                finished.set(true);
            }
        },
        || finished.get(),
    );

    transport.disconnect();
    info!(
        "session closed: {} code bodies, {} call targets",
        store.code_count(),
        store.target_count()
    );

    Ok(store)
}

//! Redaction service
//!
//! Takes scanned PDFs, finds personal data with Azure Document Intelligence
//! and Azure OpenAI, and writes a permanently redacted copy to blob storage.
//!
//! - `serve`: HTTP API (`POST /api/documents/{*path}`)
//! - `redact`: one-shot run over a local file

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use redaction_service::api::{create_router, AppState};
use redaction_service::collaborators::LocalBlobStore;
use redaction_service::config::Config;
use redaction_service::pipeline::{InboundDocument, Pipeline};

/// Command-line arguments for the redaction service
#[derive(Parser, Debug)]
#[command(name = "redaction-service")]
#[command(about = "PII redaction for scanned PDF records")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host address to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
    },
    /// Redact a single local PDF
    Redact {
        /// PDF to redact
        #[arg(short, long)]
        input: PathBuf,

        /// Blob path to report the document under (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Write the result here instead of the configured storage account
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Invalid configuration")?;
    let pipeline = Pipeline::from_config(&config)?;

    match args.command {
        Command::Serve { port, host } => {
            let state = AppState::new(pipeline, config.max_concurrent);
            let app = create_router(state);

            let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
            let listener = tokio::net::TcpListener::bind(addr).await?;

            info!("Server listening on http://{}", addr);
            info!(
                "Document timeout: {}s, max concurrent documents: {}",
                config.document_timeout.as_secs(),
                config.max_concurrent
            );

            axum::serve(listener, app).await?;
        }
        Command::Redact {
            input,
            name,
            output_dir,
        } => {
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let path = match name {
                Some(name) => name,
                None => input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("Input path has no file name")?,
            };

            let pipeline = match output_dir {
                Some(dir) => pipeline.with_store(Arc::new(LocalBlobStore::new(dir))),
                None => pipeline,
            };

            let receipt = pipeline.run(InboundDocument { path, bytes }).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
    }

    Ok(())
}

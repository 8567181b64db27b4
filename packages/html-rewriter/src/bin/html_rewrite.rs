//! Rewrite an HTML document with a JSON rule set.
//!
//! ```bash
//! html-rewrite page.html --rules rules.json --output out.html
//! curl -s https://example.com | html-rewrite --rules rules.json --mode legacy
//! ```

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use html_rewriter::{FlushOutcome, RewriterSettings, RuleSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::io::ReaderStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "html-rewrite", about = "Stream an HTML document through a rewrite rule set")]
struct Args {
    /// Input file (reads stdin when omitted)
    input: Option<PathBuf>,

    /// JSON rule set to apply
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Output file (writes stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Adapter used to drive the rewrite
    #[arg(long, value_enum, default_value_t = Mode::Pipe)]
    mode: Mode,

    /// Parse <esi:*> tags as elements
    #[arg(long)]
    esi: bool,

    /// Legacy mode flush timeout (overrides HTML_REWRITER_FLUSH_TIMEOUT_MS)
    #[arg(long)]
    flush_timeout_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Pipe,
    Legacy,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only the document
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,html_rewriter=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();

    let mut settings = RewriterSettings::from_env().context("Invalid rewriter settings")?;
    if args.esi {
        settings.enable_esi_tags = true;
    }
    if let Some(ms) = args.flush_timeout_ms {
        settings.flush_timeout = Duration::from_millis(ms);
    }

    let rules = match &args.rules {
        Some(path) => RuleSet::load(path)
            .await
            .with_context(|| format!("Failed to load rules from {}", path.display()))?,
        None => RuleSet::default(),
    };
    tracing::info!(rules = rules.rules.len(), mode = ?args.mode, "Starting rewrite");

    let rewriter = rules.apply(settings.rewriter());

    let reader: Pin<Box<dyn AsyncRead>> = match &args.input {
        Some(path) => Box::pin(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::pin(tokio::io::stdin()),
    };
    let writer: Pin<Box<dyn AsyncWrite>> = match &args.output {
        Some(path) => Box::pin(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::pin(tokio::io::stdout()),
    };

    match args.mode {
        Mode::Pipe => {
            let summary = rewriter
                .pipe_io(reader, writer)
                .await
                .context("Rewrite failed")?;
            tracing::info!(chunks = summary.chunks, bytes = summary.bytes, "Rewrite complete");
        }
        Mode::Legacy => {
            let sink = FramedWrite::new(writer, BytesCodec::new());
            let outcome = rewriter
                .pipe_legacy(ReaderStream::new(reader), sink, settings.legacy_options())
                .await
                .context("Rewrite failed")?;
            match outcome {
                FlushOutcome::Drained => tracing::info!("Rewrite complete"),
                FlushOutcome::TimedOut { outstanding } => {
                    tracing::warn!(outstanding, "Rewrite completed after flush timeout")
                }
            }
        }
    }

    Ok(())
}

//! Magpie CLI - Media Stream Grabber
//!
//! Extracts the media stream behind a kukaj.* page and downloads it,
//! printing progress to stderr as it goes.

use anyhow::Result;
use clap::Parser;
use magpie_core::progress::{CallbackSink, ProgressEvent, Reporter, Severity};
use magpie_core::{Engine, EngineOptions, PageTarget, PlatformProfile, Provider};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "magpie")]
#[command(author, version, about = "Extract and download streams from kukaj.* pages", long_about = None)]
struct Cli {
    /// Page URL to extract from
    url: String,

    /// Output file path (derived from the page URL when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for derived output names
    #[arg(short = 'd', long, default_value = ".")]
    output_dir: PathBuf,

    /// Hosting source to activate: tap, mon, mix
    #[arg(short, long)]
    source: Option<Provider>,

    /// Always produce a playable MP4 (transcode playlists)
    #[arg(long)]
    mp4: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    if cli.verbose {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(tracing_subscriber::EnvFilter::new("debug"))
            .init();
    }

    let reporter = Reporter::new(Arc::new(CallbackSink(|event: ProgressEvent| {
        let marker = match event.severity {
            Severity::Info => "·",
            Severity::Success => "✓",
            Severity::Warning => "!",
            Severity::Error => "✗",
        };
        eprintln!("{} {}", marker, event.message);
    })));

    let options = EngineOptions {
        output: cli.output,
        output_dir: cli.output_dir,
        force_mp4: cli.mp4,
        profile: PlatformProfile::detect(),
    };

    let mut target = PageTarget::new(cli.url);
    if let Some(source) = cli.source {
        target = target.with_source(source);
    }

    let path = Engine::new(options, reporter).run(&target).await?;
    println!("{}", path.display());
    Ok(())
}

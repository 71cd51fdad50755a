use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use switchboard::api::ApiServerBuilder;
use switchboard::pipeline::completion::language_model;
use switchboard::pipeline::synthesis::synthesize_all;
use switchboard::pipeline::{
    CallerContext, CompletionEvent, CompletionRequest, CompletionStreamer, ElevenLabsSynthesizer,
};
use switchboard::session::{CallServices, SessionRegistry};
use switchboard::Config;

/// Switchboard - real-time voice agent for phone calls
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Port to listen on (overrides configuration)
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the telephony webhook and media stream (default)
    Serve,
    /// Synthesize text with the configured voice and write the raw audio
    Synthesize {
        /// Text to speak
        text: String,
        /// Output file
        #[arg(short, long, default_value = "speech.ulaw")]
        output: PathBuf,
    },
    /// Run one completion and print the reply fragments
    Complete {
        /// Caller utterance
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,switchboard=info",
        1 => "info,switchboard=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Synthesize { text, output } => synthesize(&config, &text, output).await,
        Command::Complete { text } => complete(&config, text).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    tracing::info!(
        port = config.server.port,
        completion = ?config.completion.backend,
        synthesis = ?config.synthesis.mode,
        "starting switchboard"
    );

    let services = CallServices::from_config(&config)?;
    let server = ApiServerBuilder::new(Arc::new(config), services)
        .registry(Arc::new(SessionRegistry::default()))
        .build();

    let handle = server.spawn();

    tokio::select! {
        result = handle => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}

async fn synthesize(config: &Config, text: &str, output: PathBuf) -> anyhow::Result<()> {
    let synthesizer = ElevenLabsSynthesizer::new(reqwest::Client::new(), &config.synthesis)?;
    let audio = synthesize_all(&synthesizer, text).await?;

    tokio::fs::write(&output, &audio).await?;
    println!(
        "wrote {} bytes of {} audio to {}",
        audio.len(),
        config.synthesis.output_format,
        output.display()
    );
    Ok(())
}

async fn complete(config: &Config, text: String) -> anyhow::Result<()> {
    let model = language_model(&config.completion, reqwest::Client::new())?;
    let streamer = CompletionStreamer::new(model, &config.completion);

    let request = CompletionRequest {
        interaction: 1,
        text,
        interruption: false,
        context: Arc::new(CallerContext {
            session_id: uuid::Uuid::new_v4().to_string(),
            details: std::collections::HashMap::new(),
        }),
    };

    let (tx, mut rx) = mpsc::channel(16);
    let task = streamer.spawn(request, tx);

    while let Some(event) = rx.recv().await {
        match event {
            CompletionEvent::Fragment(fragment) => {
                println!("[{}] {}", fragment.fragment_index.unwrap_or_default(), fragment.text);
            }
            CompletionEvent::Finished { fragment_count, .. } => {
                println!("({fragment_count} fragments)");
            }
        }
    }

    task.await?;
    Ok(())
}

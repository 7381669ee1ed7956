use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use companion_gateway::backends;
use companion_gateway::pipeline::proactive;
use companion_gateway::{Config, Daemon};

/// Companion - low-latency voice conversation gateway
#[derive(Parser)]
#[command(name = "companion", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve devices (default)
    Serve,
    /// Print the resolved configuration
    Config,
    /// List the proactive rules that would be loaded
    Rules,
    /// Synthesize one sentence with the configured TTS backend
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Write the audio to this file
        #[arg(short, long, default_value = "tts-test.wav")]
        out: PathBuf,
    },
    /// Transcribe a WAV file with the configured STT backend
    TestStt {
        /// 16-bit mono WAV file
        wav: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,companion_gateway=info",
        1 => "info,companion_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(addr = %config.bind_addr(), "starting companion gateway");
            Daemon::new(config)?.run().await?;
            Ok(())
        }
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
        Command::Rules => list_rules(&config),
        Command::TestTts { text, out } => test_tts(&config, &text, &out).await,
        Command::TestStt { wav } => test_stt(&config, &wav).await,
    }
}

fn list_rules(config: &Config) -> anyhow::Result<()> {
    let rules = proactive::load_rules(config.proactive.rules_path.as_deref())?;
    if !config.proactive.enabled {
        println!("(proactive check-ins are disabled)");
    }
    for rule in rules {
        println!(
            "{:>3}  {:<24} {}",
            rule.priority,
            rule.name,
            rule.condition.kind().framing()
        );
    }
    Ok(())
}

async fn test_tts(config: &Config, text: &str, out: &Path) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synthesizer = backends::synthesizer(&config.backends.tts)?;
    println!("Synthesizing speech with {}...", synthesizer.name());

    let audio = synthesizer
        .synthesize(text, &config.backends.tts.voice)
        .await?;
    println!("Got {} bytes of audio data", audio.len());

    std::fs::write(out, &audio)?;
    println!("Wrote {}", out.display());
    Ok(())
}

async fn test_stt(config: &Config, wav: &Path) -> anyhow::Result<()> {
    let data = std::fs::read(wav)?;
    let transcriber = backends::transcriber(&config.backends.stt)?;
    println!("Transcribing {} with {}...", wav.display(), transcriber.name());

    let transcript = transcriber.transcribe(&data).await?;
    println!(
        "\"{}\" (confidence {:.2})",
        transcript.text, transcript.confidence
    );
    Ok(())
}

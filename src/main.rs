//! call-speaker-rs: drive a spoken LLM conversation from the terminal.
//!
//! Each stdin line is one caller utterance. Ordered audio events are written
//! as JSON lines to stdout (or `--output`); logs go to stderr.

use call_speaker::history::HistoryLog;
use call_speaker::{run_sink, BackendRegistry, CallSession, Config, JsonLinesSink, PipelineError};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "call-speaker-rs", about = "Ordered streaming speech for LLM phone calls")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Language-model backend name (overrides llm.provider)
    #[arg(long)]
    llm: Option<String>,

    /// Speech-synthesis backend name (overrides tts.provider)
    #[arg(long)]
    tts: Option<String>,

    /// Call identifier passed to the model and recorded in history
    #[arg(long)]
    call_id: Option<String>,

    /// Write audio events to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Assistant greeting already played to the caller
    #[arg(long)]
    greeting: Option<String>,

    /// Print the history report for a date (YYYY-MM-DD or "today") and exit
    #[arg(long)]
    report: Option<String>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise keep HTTP internals quiet
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("debug,hyper=info,reqwest=info")
        } else {
            EnvFilter::new("info,hyper=warn,reqwest=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref());
    if let Some(llm) = args.llm {
        config.llm.provider = llm;
    }
    if let Some(tts) = args.tts {
        config.tts.provider = tts;
    }

    if let Some(date) = args.report {
        let log = HistoryLog::new(config.history.resolved_dir());
        println!("{}", log.generate_report(&date));
        return Ok(());
    }

    let call_id = args
        .call_id
        .unwrap_or_else(|| format!("CALL-{}", chrono::Local::now().format("%Y%m%d%H%M%S")));
    info!("call-speaker-rs starting (call {call_id})");

    let registry = BackendRegistry::with_defaults();
    let (mut session, output) = CallSession::from_config(&config, &registry, &call_id)?;
    if let Some(greeting) = args.greeting {
        session.seed_turn("assistant", &greeting)?;
    }

    let sink_task = match args.output {
        Some(path) => {
            let sink = JsonLinesSink::create(&path).await?;
            info!("Writing audio events to {}", path.display());
            tokio::spawn(run_sink(output, sink))
        }
        None => tokio::spawn(run_sink(output, JsonLinesSink::stdout())),
    };

    info!("Ready: one utterance per line, /interrupt to barge in, EOF to hang up");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/interrupt" {
            session.interrupt().await?;
            continue;
        }

        match session.handle_utterance(line).await {
            Ok(interaction_id) => debug!("Interaction {interaction_id} dispatched"),
            Err(PipelineError::CompletionFailed { cause }) => {
                warn!("Completion failed ({cause}); the utterance is kept, send another line to retry");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let summary = session.finish().await;
    sink_task.await??;
    info!("Call summary:\n{summary}");

    Ok(())
}

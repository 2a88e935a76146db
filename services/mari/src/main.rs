//! Main Entrypoint for the Mari terminal client
//!
//! 1. Loads configuration from the environment and the command line.
//! 2. Opens the conversation store and picks the one-shot gateway.
//! 3. Builds the live bridge on top of cpal and Gemini Live.
//! 4. Runs a single-threaded loop over stdin lines, bridge events and chat replies.

mod app;
mod commands;
mod config;

use anyhow::Context;
use app::App;
use clap::Parser;
use config::{Args, Config};
use gemini_realtime::GeminiLiveTransport;
use mari_core::{
    gateway::{HttpGateway, LessonGateway},
    live::{LiveBridge, LiveEvent, LiveSlot},
    llm_client::{OpenAICompatibleGateway, gemini_config},
    prompts::PromptSet,
    store::{ConversationStore, FileStorage},
};
use mari_native_utils::CpalDevices;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

fn build_gateway(config: &Config, prompts: &PromptSet) -> anyhow::Result<Arc<dyn LessonGateway>> {
    if let Some(url) = &config.gateway_url {
        info!(%url, "Using the HTTP gateway.");
        return Ok(Arc::new(HttpGateway::new(url.clone())));
    }
    let api_key = config
        .gemini_api_key
        .as_deref()
        .context("GEMINI_API_KEY is required without GATEWAY_URL")?;
    info!(model = %config.chat_model, "Calling Gemini directly.");
    Ok(Arc::new(OpenAICompatibleGateway::new(
        gemini_config(api_key),
        config.chat_model.clone(),
        prompts.system.clone(),
        prompts.analyze.clone(),
    )))
}

fn build_live(
    config: &Config,
    prompts: PromptSet,
) -> Option<(LiveBridge, mpsc::UnboundedReceiver<LiveEvent>)> {
    let api_key = config.gemini_api_key.as_deref()?;
    let mut transport = GeminiLiveTransport::new(api_key);
    if let Some(model) = &config.live_model {
        transport = transport.with_model(model.clone());
    }
    if let Some(voice) = &config.live_voice {
        transport = transport.with_voice(voice.clone());
    }
    let devices = CpalDevices::new(config.input_device.clone(), config.output_device.clone());
    Some(LiveBridge::new(
        Box::new(devices),
        Box::new(transport),
        prompts,
        LiveSlot::new(),
    ))
}

async fn next_live_event(
    events: &mut Option<mpsc::UnboundedReceiver<LiveEvent>>,
) -> Option<LiveEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let prompts = PromptSet::load(&config.prompts_path)
        .with_context(|| format!("Failed to load prompts from {}", config.prompts_path.display()))?;
    let store = ConversationStore::open(Box::new(FileStorage::new(config.data_dir.clone())));
    let gateway = build_gateway(&config, &prompts)?;

    let (bridge, mut events) = match build_live(&config, prompts) {
        Some((bridge, rx)) => (Some(bridge), Some(rx)),
        None => {
            info!("No GEMINI_API_KEY; live mode disabled.");
            (None, None)
        }
    };

    let (mut app, mut replies) = App::new(store, gateway, bridge, std::io::stdout());
    println!("Willkommen bei Deutsch mit Mari! Tippe 'help' für alle Befehle.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !app.execute(commands::parse(&line)).await? {
                    break;
                }
            }
            Some(event) = next_live_event(&mut events) => {
                app.on_live_event(event)?;
            }
            Some(reply) = replies.recv() => {
                app.on_reply(reply)?;
            }
        }
    }

    info!("Client has shut down.");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env(&args).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(data_dir = %config.data_dir.display(), "Configuration loaded.");

    // cpal streams are not Send; keep everything on this thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

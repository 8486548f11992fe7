//! tars-server: brain-side process
//!
//! Accepts one client, runs conversations against the streaming language
//! model and speaks the replies back.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use tars_link::assistant::{
    Assistant, ElevenLabsSpeech, GeminiConnector, SpeechSynth, ToolRegistry,
};
use tars_link::config::{require_env, ConfigService};
use tars_link::lifecycle::{self, ShutdownSignal};
use tars_link::transport::LinkServer;

/// Link events waiting for the assistant loop
const LINK_EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigService::load().context("failed to load configuration")?;
    let settings = config.settings().clone();
    lifecycle::init_logging(&settings.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "tars-server starting");

    let gemini_key = require_env("GEMINI_API_KEY").context("language model credentials")?;
    let elevenlabs_key = require_env("ELEVENLABS_API_KEY").context("speech credentials")?;

    let mut shutdown = ShutdownSignal::new().context("failed to install signal handlers")?;

    let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_BUFFER);
    let server = LinkServer::bind(&settings.server.bind_addr(), events_tx)
        .await
        .context("failed to bind websocket server")?;

    let llm = Arc::new(GeminiConnector::new(gemini_key, settings.llm.clone()));
    // Without speech the assistant still answers, just silently
    let tts: Option<Arc<dyn SpeechSynth>> = match ElevenLabsSpeech::new(elevenlabs_key, settings.tts.clone()) {
        Ok(tts) => Some(Arc::new(tts)),
        Err(e) => {
            warn!(error = %e, "speech synthesis disabled");
            None
        }
    };

    let mut assistant = Assistant::new(
        server.handle(),
        events_rx,
        llm,
        tts,
        ToolRegistry::with_builtin(),
        &settings.conversation,
    );

    let accept = tokio::spawn(async move { server.run().await });
    info!("server initialized, waiting for a client connection");

    assistant.run(shutdown.wait()).await;

    accept.abort();
    info!("tars-server stopped");
    Ok(())
}

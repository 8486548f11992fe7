//! tars-client: device-side process
//!
//! Listens for the wake phrase or a button press, streams speech to the
//! server over one persistent connection and plays the spoken replies.

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use tars_link::audio::{self, AudioRouter};
use tars_link::button::{self, ButtonListener};
use tars_link::config::{AudioBackend, ConfigService};
use tars_link::hotword;
use tars_link::lifecycle::{self, ShutdownSignal};
use tars_link::session::SessionOrchestrator;
use tars_link::sounds::AckSoundLibrary;
use tars_link::transport::TransportClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigService::load().context("failed to load configuration")?;
    let settings = config.settings().clone();
    lifecycle::init_logging(&settings.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "tars-client starting");
    if let Some(path) = config.override_path() {
        info!(path = %path.display(), "configuration override file");
    }

    let mut shutdown = ShutdownSignal::new().context("failed to install signal handlers")?;

    let device = audio::open_device(&settings.audio).context("failed to open audio device")?;
    let router = AudioRouter::new(device, audio::playback_policy(&settings.audio));
    let detector = hotword::from_settings(&settings.hotword).context("failed to load wake-word model")?;
    let sounds = AckSoundLibrary::load(&settings.sounds.directory, &settings.sounds.acknowledgements);
    if sounds.is_empty() {
        warn!("no acknowledgement sounds loaded");
    }

    let url = settings.server.url();
    info!(%url, "server endpoint");
    let (transport, transport_events) = TransportClient::new(url, &settings.transport);

    let mut orchestrator = SessionOrchestrator::new(router, detector, transport, transport_events, sounds);

    // Physical button only exists on the embedded board
    let button = ButtonListener::new(orchestrator.event_sender(), settings.button.clone());
    if settings.button.enabled && settings.audio.backend == AudioBackend::Embedded {
        match button::open_line(&settings.button).and_then(|line| button.start(line)) {
            Ok(()) => info!(pin = settings.button.gpio_pin, "button listener started"),
            Err(e) => {
                error!(error = %e, "failed to start button listener");
                warn!("continuing with wake-word activation only");
            }
        }
    }

    orchestrator.start();
    info!("client initialized, entering main loop");

    orchestrator.run(shutdown.wait()).await;

    button.stop();
    info!("tars-client stopped");
    Ok(())
}

//! Push-to-talk button polling thread
//!
//! Samples the line at a fixed interval on a dedicated thread and posts an
//! activation into the event loop on each debounced press.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::ButtonSettings;
use crate::events::{ActivationSource, ClientEvent};

/// Pause after a read error before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A digital input wired to the button
pub trait ButtonLine: Send {
    /// True while the button is held
    fn is_pressed(&mut self) -> Result<bool, ButtonError>;
}

/// Errors that can occur in the button listener
#[derive(Debug, thiserror::Error)]
pub enum ButtonError {
    #[error("button listener is already running")]
    AlreadyRunning,

    #[error("button line unavailable: {0}")]
    Unavailable(String),

    #[error("gpio error: {0}")]
    Gpio(String),

    #[error("failed to spawn listener thread: {0}")]
    ThreadSpawn(String),
}

/// Falling-edge detection with a minimum gap between presses
pub struct Debouncer {
    window: Duration,
    was_pressed: bool,
    last_press: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            was_pressed: false,
            last_press: None,
        }
    }

    /// Feed one sample; true when it is a press to act on
    pub fn on_sample(&mut self, pressed: bool, now: Instant) -> bool {
        let edge = pressed && !self.was_pressed;
        self.was_pressed = pressed;
        if !edge {
            return false;
        }

        if let Some(last) = self.last_press {
            if now.duration_since(last) < self.window {
                debug!("button press ignored due to debounce");
                return false;
            }
        }
        self.last_press = Some(now);
        true
    }
}

pub struct ButtonListener {
    event_tx: mpsc::Sender<ClientEvent>,
    running: Arc<AtomicBool>,
    settings: ButtonSettings,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ButtonListener {
    pub fn new(event_tx: mpsc::Sender<ClientEvent>, settings: ButtonSettings) -> Self {
        Self {
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
            settings,
            thread: Mutex::new(None),
        }
    }

    /// Start polling `line` on a dedicated thread
    pub fn start(&self, line: Box<dyn ButtonLine>) -> Result<(), ButtonError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ButtonError::AlreadyRunning);
        }

        let event_tx = self.event_tx.clone();
        let running = Arc::clone(&self.running);
        let interval = Duration::from_millis(self.settings.polling_interval_ms.max(1));
        let debouncer = Debouncer::new(Duration::from_secs_f64(
            self.settings.debounce_seconds.max(0.0),
        ));
        let pin = self.settings.gpio_pin;

        let handle = thread::Builder::new()
            .name("button-listener".to_string())
            .spawn(move || {
                info!(pin, "button listener thread started");
                poll_loop(line, debouncer, interval, &event_tx, &running);
                running.store(false, Ordering::SeqCst);
                info!("button listener thread stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ButtonError::ThreadSpawn(e.to_string())
            })?;

        if let Ok(mut slot) = self.thread.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Stop polling and wait for the thread to exit
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("button listener thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn poll_loop(
    mut line: Box<dyn ButtonLine>,
    mut debouncer: Debouncer,
    interval: Duration,
    event_tx: &mpsc::Sender<ClientEvent>,
    running: &AtomicBool,
) {
    while running.load(Ordering::SeqCst) {
        match line.is_pressed() {
            Ok(pressed) => {
                if debouncer.on_sample(pressed, Instant::now()) {
                    info!("button pressed");
                    let event = ClientEvent::Activation {
                        source: ActivationSource::Button,
                    };
                    if event_tx.blocking_send(event).is_err() {
                        debug!("event loop gone, stopping button listener");
                        return;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "error reading button, retrying");
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        }
        thread::sleep(interval);
    }
}

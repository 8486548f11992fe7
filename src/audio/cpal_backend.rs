//! Microphone and speaker access through cpal
//!
//! cpal streams are not `Send`, so each one lives on a dedicated thread that
//! builds it, reports readiness, and parks until told to stop.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tracing::{debug, error};

use super::device::{AudioDevice, FrameSink, InputStream, OutputStream};
use super::pcm;
use crate::config::AudioSettings;
use crate::error::AudioError;

/// Poll interval while waiting for the output buffer
const OUTPUT_POLL: Duration = Duration::from_millis(10);

/// Time for the last period to leave the DAC after the buffer empties
const OUTPUT_TAIL: Duration = Duration::from_millis(100);

pub struct CpalDevice {
    settings: AudioSettings,
}

impl CpalDevice {
    pub fn new(settings: &AudioSettings) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let input = find_device(&host, settings.input_device.as_deref(), Direction::Input)?;
        debug!(
            host = ?host.id(),
            input = input.name().unwrap_or_default(),
            sample_rate = settings.sample_rate,
            "audio device initialized"
        );
        Ok(Self {
            settings: settings.clone(),
        })
    }
}

impl AudioDevice for CpalDevice {
    fn open_input(&self, sink: FrameSink) -> Result<Box<dyn InputStream>, AudioError> {
        let settings = self.settings.clone();
        let handle = spawn_stream_thread("audio-capture", "input", move || {
            build_input(&settings, sink)
        })?;
        Ok(Box::new(CpalInput { handle }))
    }

    fn open_output(&self) -> Result<Box<dyn OutputStream>, AudioError> {
        let buffer = Arc::new(Mutex::new(VecDeque::new()));
        let settings = self.settings.clone();
        let shared = Arc::clone(&buffer);
        let handle = spawn_stream_thread("audio-playback", "output", move || {
            build_output(&settings, shared)
        })?;

        let capacity = self.settings.sample_rate as usize;
        Ok(Box::new(CpalOutput {
            buffer,
            capacity,
            _handle: handle,
        }))
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Input,
    Output,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

fn find_device(host: &cpal::Host, wanted: Option<&str>, dir: Direction) -> Result<Device, AudioError> {
    let Some(wanted) = wanted else {
        let device = match dir {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        };
        return device.ok_or(AudioError::NoDevice(dir.label()));
    };

    let devices: Vec<Device> = match dir {
        Direction::Input => host.input_devices().map(Iterator::collect),
        Direction::Output => host.output_devices().map(Iterator::collect),
    }
    .map_err(|e| AudioError::Stream(e.to_string()))?;

    devices
        .into_iter()
        .find(|d| d.name().is_ok_and(|name| name.contains(wanted)))
        .ok_or_else(|| AudioError::DeviceNotFound(wanted.to_string()))
}

fn stream_config(device: &Device, sample_rate: u32, dir: Direction) -> Result<StreamConfig, AudioError> {
    let rate = SampleRate(sample_rate);
    let open_err = |reason: String| AudioError::StreamOpen {
        kind: dir.label(),
        reason,
    };

    let ranges: Vec<cpal::SupportedStreamConfigRange> = match dir {
        Direction::Input => device.supported_input_configs().map(Iterator::collect),
        Direction::Output => device.supported_output_configs().map(Iterator::collect),
    }
    .map_err(|e| open_err(e.to_string()))?;

    ranges
        .into_iter()
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .map(|c| c.with_sample_rate(rate).config())
        .ok_or_else(|| open_err(format!("no config supports {sample_rate} Hz")))
}

/// Run `build` on a named thread and keep the resulting stream alive there
fn spawn_stream_thread<F>(
    name: &str,
    kind: &'static str,
    build: F,
) -> Result<StreamThread, AudioError>
where
    F: FnOnce() -> Result<Stream, AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::StreamOpen {
                    kind,
                    reason: e.to_string(),
                }));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Either an explicit stop or the handle being dropped ends the stream
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| AudioError::StreamOpen {
            kind,
            reason: e.to_string(),
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamThread {
            stop: Some(stop_tx),
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err(AudioError::Stream(format!("{kind} thread exited early"))),
    }
}

struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("audio stream thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input(settings: &AudioSettings, sink: FrameSink) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, settings.input_device.as_deref(), Direction::Input)?;
    let config = stream_config(&device, settings.sample_rate, Direction::Input)?;
    let channels = usize::from(config.channels);
    let block_size = settings.block_size.max(1);
    let mut pending: Vec<f32> = Vec::with_capacity(block_size);

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // First channel only; the pipeline is mono
                pending.extend(data.iter().step_by(channels));
                while pending.len() >= block_size {
                    let block: Vec<f32> = pending.drain(..block_size).collect();
                    if !sink.push(pcm::f32_to_s16le(&block)) {
                        return;
                    }
                }
            },
            |err| {
                error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| AudioError::StreamOpen {
            kind: "input",
            reason: e.to_string(),
        })
}

fn build_output(
    settings: &AudioSettings,
    buffer: Arc<Mutex<VecDeque<i16>>>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = find_device(&host, settings.output_device.as_deref(), Direction::Output)?;
    let config = stream_config(&device, settings.sample_rate, Direction::Output)?;
    let channels = usize::from(config.channels);

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut buffer) = buffer.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = buffer.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                    frame.fill(sample);
                }
            },
            |err| {
                error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| AudioError::StreamOpen {
            kind: "output",
            reason: e.to_string(),
        })
}

struct CpalInput {
    handle: StreamThread,
}

impl InputStream for CpalInput {
    fn close(mut self: Box<Self>) {
        self.handle.stop();
        debug!("audio capture stopped");
    }
}

struct CpalOutput {
    buffer: Arc<Mutex<VecDeque<i16>>>,
    capacity: usize,
    _handle: StreamThread,
}

impl CpalOutput {
    fn buffered(&self) -> Result<usize, AudioError> {
        self.buffer
            .lock()
            .map(|b| b.len())
            .map_err(|_| AudioError::Stream("output buffer poisoned".to_string()))
    }
}

#[async_trait]
impl OutputStream for CpalOutput {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), AudioError> {
        while self.buffered()? >= self.capacity {
            tokio::time::sleep(OUTPUT_POLL).await;
        }

        let samples = pcm::s16le_to_i16(bytes);
        self.buffer
            .lock()
            .map_err(|_| AudioError::Stream("output buffer poisoned".to_string()))?
            .extend(samples);
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), AudioError> {
        while self.buffered()? > 0 {
            tokio::time::sleep(OUTPUT_POLL).await;
        }
        tokio::time::sleep(OUTPUT_TAIL).await;
        Ok(())
    }
}

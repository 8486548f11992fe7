//! Server-side conversation brain
//!
//! One event loop owns the [`ConversationManager`] and the open model
//! session. It multiplexes link events from the client, model responses,
//! speech progress and a one-second inactivity tick.
//!
//! A turn runs `Active -> Processing -> Speaking -> Active`: the model's text
//! is spoken between `start_of_tts_stream` and `tts_stream_end`, and the
//! microphone is only re-armed when the client confirms `playback_complete`.
//! Ending a session never closes the client's connection.

mod collab;
mod elevenlabs;
mod gemini;
mod phrases;
#[cfg(test)]
mod testing;
mod tools;

pub use collab::{AudioStream, LlmConnector, LlmResponse, LlmSession, SessionPeer, SpeechSynth};
pub use elevenlabs::ElevenLabsSpeech;
pub use gemini::GeminiConnector;
pub use phrases::{canonicalize, EndPhrases};
pub use tools::{ToolCall, ToolRegistry, ToolResult};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConversationSettings;
use crate::error::{CollaboratorError, Error};
use crate::state::{ConversationManager, ConversationState};
use crate::transport::{CloseCode, ControlMessage, LinkEvent, LinkHandle};

/// Inactivity check period
const TICK: Duration = Duration::from_secs(1);

/// Time given to an in-flight speech task when shutting down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Time given to the client to answer our close frame
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    EndPhrase,
    Timeout,
    Disconnected,
    CollaboratorFailure,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::EndPhrase => write!(f, "end phrase"),
            EndReason::Timeout => write!(f, "inactivity timeout"),
            EndReason::Disconnected => write!(f, "client disconnected"),
            EndReason::CollaboratorFailure => write!(f, "collaborator failure"),
        }
    }
}

/// Snapshot of the assistant for logs and observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistantStatus {
    pub conversation_state: ConversationState,
    pub llm_session_open: bool,
    pub tts_available: bool,
    pub client_connected: bool,
}

/// Progress reported by the task streaming speech to the client
#[derive(Debug)]
enum SpeechEvent {
    Chunk { turn: u64 },
    Finished { turn: u64, result: Result<usize, Error> },
}

/// Text and transcript accumulated within one turn
#[derive(Default)]
struct TurnBuffer {
    response: String,
    transcript: String,
}

pub struct Assistant {
    conversation: ConversationManager,
    link: LinkHandle,
    link_events: mpsc::Receiver<LinkEvent>,
    llm: Arc<dyn LlmConnector>,
    tts: Option<Arc<dyn SpeechSynth>>,
    tools: Arc<ToolRegistry>,
    end_phrases: EndPhrases,
    session: Option<LlmSession>,
    buffer: TurnBuffer,
    speech: Option<JoinHandle<()>>,
    speech_tx: mpsc::UnboundedSender<SpeechEvent>,
    speech_rx: mpsc::UnboundedReceiver<SpeechEvent>,
    /// Incremented per spoken turn; stale speech events are ignored
    turn: u64,
    /// Set once `tts_stream_end` went out for the current turn
    awaiting_playback: bool,
    /// Reply completed while the previous one was still speaking
    pending_reply: Option<String>,
    tick: Duration,
    status: watch::Sender<AssistantStatus>,
}

impl Assistant {
    pub fn new(
        link: LinkHandle,
        link_events: mpsc::Receiver<LinkEvent>,
        llm: Arc<dyn LlmConnector>,
        tts: Option<Arc<dyn SpeechSynth>>,
        tools: ToolRegistry,
        settings: &ConversationSettings,
    ) -> Self {
        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(AssistantStatus {
            conversation_state: ConversationState::Passive,
            llm_session_open: false,
            tts_available: tts.is_some(),
            client_connected: false,
        });

        Self {
            conversation: ConversationManager::new(settings.timeout()),
            link,
            link_events,
            llm,
            tts,
            tools: Arc::new(tools),
            end_phrases: EndPhrases::from_settings(settings),
            session: None,
            buffer: TurnBuffer::default(),
            speech: None,
            speech_tx,
            speech_rx,
            turn: 0,
            awaiting_playback: false,
            pending_reply: None,
            tick: TICK,
            status,
        }
    }

    /// Override the inactivity timeout and its polling period
    pub fn with_timeout(mut self, timeout: Duration, tick: Duration) -> Self {
        self.conversation = ConversationManager::new(timeout);
        self.tick = tick;
        self
    }

    pub fn state(&self) -> ConversationState {
        self.conversation.state()
    }

    pub fn status(&self) -> AssistantStatus {
        AssistantStatus {
            conversation_state: self.conversation.state(),
            llm_session_open: self.session.is_some(),
            tts_available: self.tts.is_some(),
            client_connected: self.link.is_connected(),
        }
    }

    /// Watch status snapshots as they change
    pub fn subscribe(&self) -> watch::Receiver<AssistantStatus> {
        self.status.subscribe()
    }

    /// Process events until `shutdown` resolves, then tear down
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("assistant ready, waiting for a client");

        loop {
            // Speech progress first: a `playback_complete` can only follow it
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(event) = self.speech_rx.recv() => self.on_speech_event(event).await,
                event = self.link_events.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => {
                        error!("link event channel closed");
                        break;
                    }
                },
                response = next_response(&mut self.session) => match response {
                    Some(Ok(response)) => self.on_response(response).await,
                    Some(Err(e)) => {
                        error!(error = %e, "llm session failed");
                        self.end_session(EndReason::CollaboratorFailure).await;
                    }
                    None => {
                        warn!("llm session closed unexpectedly");
                        self.end_session(EndReason::CollaboratorFailure).await;
                    }
                },
                _ = tick.tick() => self.check_timeout().await,
            }
            self.publish();
        }

        self.shutdown().await;
    }

    /// Cancel session work, close the client with 1001 and the model session
    pub async fn shutdown(&mut self) {
        info!("assistant shutting down");
        if let Some(mut speech) = self.speech.take() {
            speech.abort();
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut speech).await.is_err() {
                warn!("speech task did not exit within the grace period");
            }
        }
        if self.link.is_connected() {
            self.link.close(CloseCode::Away, "server shutting down");
            self.wait_for_disconnect().await;
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.conversation.reset_to_passive();
        self.publish();
        info!("assistant stopped");
    }

    /// Wait until the close handshake has gone through the link
    async fn wait_for_disconnect(&mut self) {
        let closed = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(event) = self.link_events.recv().await {
                if event == LinkEvent::Disconnected {
                    break;
                }
            }
        })
        .await;
        if closed.is_err() {
            warn!("client did not complete the close handshake in time");
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer } => info!(%peer, "client attached"),
            LinkEvent::Control(ControlMessage::HotwordDetected) => self.activate().await,
            LinkEvent::Control(ControlMessage::PlaybackComplete) => self.on_playback_complete().await,
            LinkEvent::Control(other) => warn!(message = %other, "unexpected control message from client"),
            LinkEvent::Audio(pcm) => self.forward_audio(pcm),
            LinkEvent::Disconnected => {
                if self.conversation.state() != ConversationState::Passive {
                    info!("client disconnected mid-session");
                    self.end_session(EndReason::Disconnected).await;
                }
            }
        }
    }

    async fn activate(&mut self) {
        if self.conversation.state() != ConversationState::Passive {
            warn!(state = %self.conversation.state(), "activation ignored, session already running");
            return;
        }

        info!("hotword detected by client, opening llm session");
        match self.llm.open(&self.tools).await {
            Ok(session) => {
                self.session = Some(session);
                self.buffer = TurnBuffer::default();
                self.conversation.transition_to(ConversationState::Active);
                info!("listening for user speech");
            }
            Err(e) => {
                error!(error = %e, "failed to open llm session");
                self.end_session(EndReason::CollaboratorFailure).await;
            }
        }
    }

    /// User audio only reaches the model while `Active`; anything else is dropped
    fn forward_audio(&mut self, pcm: Vec<u8>) {
        match &self.session {
            Some(session) if self.conversation.should_listen_for_speech() => {
                if !session.queue_audio(pcm) {
                    debug!("llm session gone, audio dropped");
                }
            }
            _ => trace!(bytes = pcm.len(), state = %self.conversation.state(), "audio dropped"),
        }
    }

    async fn on_response(&mut self, response: LlmResponse) {
        if !response.text.is_empty() {
            if self.conversation.state() == ConversationState::Active {
                self.conversation.transition_to(ConversationState::Processing);
            }
            self.buffer.response.push_str(&response.text);
        }

        if !response.transcript.is_empty() {
            self.conversation.update_activity();
            self.buffer.transcript.push_str(&response.transcript);
            debug!(transcript = %self.buffer.transcript, "user speech");

            if self.end_phrases.matches(&self.buffer.transcript) {
                info!(transcript = %self.buffer.transcript, "session end phrase detected");
                self.end_session(EndReason::EndPhrase).await;
                return;
            }
        }
        if response.transcript_finished {
            self.buffer.transcript.clear();
        }

        if !response.tool_calls.is_empty() {
            let results: Vec<ToolResult> = response
                .tool_calls
                .iter()
                .map(|call| self.tools.call(call))
                .collect();
            if let Some(session) = &self.session {
                session.send_tool_results(results);
            }
        }

        if response.turn_complete {
            let text = std::mem::take(&mut self.buffer).response.trim().to_string();
            if text.is_empty() {
                if self.conversation.state() == ConversationState::Processing {
                    self.conversation.transition_to(ConversationState::Active);
                }
            } else if self.conversation.state() == ConversationState::Speaking {
                debug!(response = %text, "reply held until playback completes");
                match &mut self.pending_reply {
                    Some(pending) => {
                        pending.push(' ');
                        pending.push_str(&text);
                    }
                    None => self.pending_reply = Some(text),
                }
            } else {
                info!(response = %text, "assistant response");
                self.speak(text).await;
            }
        }
    }

    async fn speak(&mut self, text: String) {
        let Some(tts) = self.tts.clone() else {
            warn!("speech synthesis unavailable, skipping voice output");
            self.conversation.transition_to(ConversationState::Active);
            return;
        };

        // Speaking is only entered from Processing
        if self.conversation.state() == ConversationState::Active {
            self.conversation.transition_to(ConversationState::Processing);
        }
        if !self.conversation.transition_to(ConversationState::Speaking) {
            warn!(state = %self.conversation.state(), "reply dropped, cannot start speaking");
            return;
        }
        self.turn += 1;
        self.awaiting_playback = false;

        // The client mutes its microphone on this before any audio arrives
        if let Err(e) = self.link.send_control(ControlMessage::StartOfTtsStream) {
            warn!(error = %e, "could not announce speech");
            self.end_session(EndReason::Disconnected).await;
            return;
        }

        info!("converting to speech and streaming");
        let task = stream_speech(tts, self.link.clone(), text, self.turn, self.speech_tx.clone());
        self.speech = Some(tokio::spawn(task));
    }

    async fn on_speech_event(&mut self, event: SpeechEvent) {
        match event {
            SpeechEvent::Chunk { turn } if turn == self.turn => self.conversation.update_activity(),
            SpeechEvent::Finished { turn, result } if turn == self.turn => {
                self.speech = None;
                match result {
                    Ok(chunks) => {
                        debug!(chunks, "speech streamed, awaiting playback");
                        self.conversation.update_activity();
                        self.awaiting_playback = true;
                    }
                    Err(e) => {
                        error!(error = %e, "speech streaming failed");
                        self.end_session(EndReason::CollaboratorFailure).await;
                    }
                }
            }
            stale => debug!(?stale, "ignoring speech event from an earlier turn"),
        }
    }

    async fn on_playback_complete(&mut self) {
        if self.conversation.state() != ConversationState::Speaking || !self.awaiting_playback {
            debug!(state = %self.conversation.state(), "stale playback_complete ignored");
            return;
        }
        self.awaiting_playback = false;
        info!("voice output completed");
        self.conversation.transition_to(ConversationState::Active);

        if let Some(text) = self.pending_reply.take() {
            info!(response = %text, "speaking held reply");
            self.speak(text).await;
        }
    }

    /// Any state but `Passive` times out; in `Speaking` the clock runs from the
    /// last streamed chunk, so a lost `playback_complete` cannot wedge the session
    async fn check_timeout(&mut self) {
        let state = self.conversation.state();
        if self.conversation.is_timed_out() {
            info!(%state, "conversation timed out");
            self.end_session(EndReason::Timeout).await;
        }
    }

    /// Tell the client (if still attached) and return to `Passive`
    async fn end_session(&mut self, reason: EndReason) {
        info!(%reason, "ending session");
        if reason != EndReason::Disconnected && self.link.is_connected() {
            if let Err(e) = self.link.send_control(ControlMessage::SessionEnd) {
                warn!(error = %e, "could not send session_end");
            }
        }

        if let Some(speech) = self.speech.take() {
            speech.abort();
        }
        self.awaiting_playback = false;
        self.pending_reply = None;
        self.buffer = TurnBuffer::default();
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.conversation.reset_to_passive();

        let status = self.status();
        info!(?status, "ready for next activation");
    }

    fn publish(&self) {
        let current = self.status();
        self.status.send_if_modified(|status| {
            if *status == current {
                return false;
            }
            *status = current;
            true
        });
    }
}

async fn next_response(
    session: &mut Option<LlmSession>,
) -> Option<Result<LlmResponse, CollaboratorError>> {
    match session {
        Some(session) => session.next_response().await,
        None => std::future::pending().await,
    }
}

async fn stream_speech(
    tts: Arc<dyn SpeechSynth>,
    link: LinkHandle,
    text: String,
    turn: u64,
    events: mpsc::UnboundedSender<SpeechEvent>,
) {
    let result = async {
        let mut audio = tts.synthesize(&text).await?;
        let mut chunks = 0usize;
        while let Some(chunk) = audio.next().await {
            link.send_audio(chunk?)?;
            chunks += 1;
            let _ = events.send(SpeechEvent::Chunk { turn });
        }
        link.send_control(ControlMessage::TtsStreamEnd)?;
        Ok::<_, Error>(chunks)
    }
    .await;

    let _ = events.send(SpeechEvent::Finished { turn, result });
}

//! Interfaces to the language model and speech synthesis services

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::tools::{ToolCall, ToolRegistry, ToolResult};
use crate::error::CollaboratorError;

/// Responses buffered between the service task and the assistant loop
const RESPONSE_BUFFER: usize = 64;

/// How long a closing session may take to say goodbye before it is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// One event from the model's response stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    /// Partial response text
    pub text: String,
    /// Partial transcript of the user's speech
    pub transcript: String,
    pub transcript_finished: bool,
    pub turn_complete: bool,
    pub tool_calls: Vec<ToolCall>,
}

/// Ordered PCM chunks in the link's audio format
pub type AudioStream = BoxStream<'static, Result<Vec<u8>, CollaboratorError>>;

#[async_trait]
pub trait LlmConnector: Send + Sync {
    /// Open a streaming conversation with the given tools enabled
    async fn open(&self, tools: &ToolRegistry) -> Result<LlmSession, CollaboratorError>;
}

#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Start streaming speech for `text`
    async fn synthesize(&self, text: &str) -> Result<AudioStream, CollaboratorError>;
}

/// Assistant side of an open model session
///
/// The session ends when the service closes the response channel or when
/// [`LlmSession::close`] drops the outbound channels.
pub struct LlmSession {
    audio: mpsc::UnboundedSender<Vec<u8>>,
    tool_results: mpsc::UnboundedSender<Vec<ToolResult>>,
    responses: mpsc::Receiver<Result<LlmResponse, CollaboratorError>>,
    task: Option<JoinHandle<()>>,
}

/// Service side of an open model session
pub struct SessionPeer {
    pub audio: mpsc::UnboundedReceiver<Vec<u8>>,
    pub tool_results: mpsc::UnboundedReceiver<Vec<ToolResult>>,
    pub responses: mpsc::Sender<Result<LlmResponse, CollaboratorError>>,
}

impl LlmSession {
    /// Create the two connected halves of a session
    pub fn pair() -> (Self, SessionPeer) {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BUFFER);

        (
            Self {
                audio: audio_tx,
                tool_results: tool_tx,
                responses: responses_rx,
                task: None,
            },
            SessionPeer {
                audio: audio_rx,
                tool_results: tool_rx,
                responses: responses_tx,
            },
        )
    }

    /// Tie the task driving the service side to this session's lifetime
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Queue user audio without waiting; false once the session is gone
    pub fn queue_audio(&self, pcm: Vec<u8>) -> bool {
        self.audio.send(pcm).is_ok()
    }

    pub fn send_tool_results(&self, results: Vec<ToolResult>) {
        if self.tool_results.send(results).is_err() {
            warn!("tool results dropped, session already closed");
        }
    }

    /// Next response; `None` once the service has closed the session
    pub async fn next_response(&mut self) -> Option<Result<LlmResponse, CollaboratorError>> {
        self.responses.recv().await
    }

    pub async fn close(self) {
        let Self {
            audio,
            tool_results,
            responses,
            task,
        } = self;
        drop(audio);
        drop(tool_results);
        drop(responses);

        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("llm session did not close in time, aborting");
                task.abort();
            }
        }
        debug!("llm session closed");
    }
}

//! Scripted collaborators for assistant tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;

use super::collab::{AudioStream, LlmConnector, LlmSession, SessionPeer, SpeechSynth};
use super::tools::ToolRegistry;
use crate::error::CollaboratorError;

/// Hands the service half of every opened session to the test
pub struct FakeLlm {
    peers: mpsc::UnboundedSender<SessionPeer>,
    fail_next: AtomicBool,
    opens: AtomicUsize,
}

impl FakeLlm {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let llm = Arc::new(Self {
            peers,
            fail_next: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
        });
        (llm, rx)
    }

    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmConnector for FakeLlm {
    async fn open(&self, _tools: &ToolRegistry) -> Result<LlmSession, CollaboratorError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::Connect("scripted failure".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (session, peer) = LlmSession::pair();
        let _ = self.peers.send(peer);
        Ok(session)
    }
}

/// Returns queued chunk scripts, one per call; an empty queue fails
#[derive(Clone, Default)]
pub struct FakeSpeech {
    scripts: Arc<Mutex<VecDeque<Vec<Vec<u8>>>>>,
    texts: Arc<Mutex<Vec<String>>>,
}

impl FakeSpeech {
    pub fn push(&self, chunks: Vec<Vec<u8>>) {
        self.scripts.lock().unwrap().push_back(chunks);
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynth for FakeSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, CollaboratorError> {
        self.texts.lock().unwrap().push(text.to_string());
        let chunks = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CollaboratorError::Protocol("no speech scripted".into()))?;
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

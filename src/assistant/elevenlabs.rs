//! ElevenLabs streaming text-to-speech

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde::Serialize;

use super::collab::{AudioStream, SpeechSynth};
use crate::config::TtsSettings;
use crate::error::CollaboratorError;

const API_BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

pub struct ElevenLabsSpeech {
    client: reqwest::Client,
    api_key: String,
    settings: TtsSettings,
}

impl ElevenLabsSpeech {
    pub fn new(api_key: String, settings: TtsSettings) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            api_key,
            settings,
        })
    }
}

#[async_trait]
impl SpeechSynth for ElevenLabsSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, CollaboratorError> {
        let url = format!("{API_BASE}/{}/stream", self.settings.voice_id);
        let request = SpeechRequest {
            text,
            model_id: &self.settings.model_id,
            voice_settings: VoiceSettings {
                stability: self.settings.stability,
                similarity_boost: self.settings.similarity_boost,
            },
        };

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", self.settings.output_format.as_str())])
            .header("xi-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Protocol(format!(
                "ElevenLabs TTS error {status}: {body}"
            )));
        }

        let body = response.bytes_stream().boxed();
        let aligned = stream::unfold((body, Vec::new()), |(mut body, mut carry)| async move {
            loop {
                match body.next().await {
                    Some(Ok(bytes)) => {
                        carry.extend_from_slice(&bytes);
                        if let Some(chunk) = take_whole_samples(&mut carry) {
                            return Some((Ok(chunk), (body, carry)));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e.into()), (body, carry))),
                    None => return None,
                }
            }
        });
        Ok(aligned.boxed())
    }
}

/// Split off the even-length prefix of `carry`, keeping a dangling byte for the next chunk
fn take_whole_samples(carry: &mut Vec<u8>) -> Option<Vec<u8>> {
    let whole = carry.len() & !1;
    if whole == 0 {
        return None;
    }
    let rest = carry.split_off(whole);
    Some(std::mem::replace(carry, rest))
}

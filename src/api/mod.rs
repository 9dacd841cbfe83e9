//! HTTP client for the assistant backend.
//!
//! One [`FocusClient`] covers every endpoint the pipeline talks to:
//! transcription, the streamed answer, per-sentence synthesis, the filler
//! clip, turn/audio persistence and session creation. "No content" answers
//! (204, 404, empty body) from the audio endpoints come back as `Ok(None)`,
//! never as errors.

pub mod sse;
pub mod types;

use crate::audio::filler::FillerSource;
use crate::config::ApiConfig;
use crate::error::{FocusError, Result};
use crate::tts::{AudioByteStream, SpeechSynthesizer};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use sse::{SseEvent, SseLineParser};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};
use types::{
    AnswerEvent, AnswerPayload, AskRequest, CreateSessionRequest, CreateSessionResponse,
    SaveAudioRequest, SaveAudioResponse, SaveMessageRequest, SaveMessageResponse,
    SynthesizeRequest, TranscribeResponse,
};

/// Typed answer-stream events, ending after [`AnswerEvent::Done`].
pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<AnswerEvent>> + Send>>;

/// Client for the assistant backend.
#[derive(Clone)]
pub struct FocusClient {
    http: reqwest::Client,
    api: Arc<ApiConfig>,
}

impl std::fmt::Debug for FocusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FocusClient")
            .field("base_url", &self.api.base_url)
            .field("user_id", &self.api.user_id)
            .finish()
    }
}

impl FocusClient {
    /// Build a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api: ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(api.connect_timeout())
            .build()?;
        Ok(Self {
            http,
            api: Arc::new(api),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.api.user_id
    }

    /// Upload recorded audio and return the transcript.
    ///
    /// # Errors
    ///
    /// Returns [`FocusError::Transcription`] when the backend reports failure
    /// or the transcript is empty, and transport errors otherwise.
    pub async fn transcribe(&self, audio: Vec<u8>, file_name: &str, mime: &str) -> Result<String> {
        let endpoint = &self.api.transcribe_path;
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name.to_owned())
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let response = self
            .http
            .post(self.api.url(endpoint))
            .multipart(form)
            .send()
            .await?;
        let response = check_status(response, endpoint)?;
        let body: TranscribeResponse = response.json().await?;

        if !body.success {
            return Err(FocusError::Transcription(
                body.error.unwrap_or_else(|| "transcription failed".to_owned()),
            ));
        }
        let transcript = body.transcript.trim();
        if transcript.is_empty() {
            return Err(FocusError::Transcription("empty transcript".to_owned()));
        }
        Ok(transcript.to_owned())
    }

    /// Open the streamed answer for a question.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be opened. Errors while reading
    /// are yielded by the returned stream.
    pub async fn ask(
        &self,
        question: &str,
        session_id: &str,
        persona: Option<&str>,
    ) -> Result<AnswerStream> {
        let endpoint = &self.api.ask_path;
        let body = AskRequest {
            question,
            user_id: &self.api.user_id,
            session_id,
            persona,
        };
        let response = self
            .http
            .post(self.api.url(endpoint))
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| FocusError::Stream(format!("answer request failed: {e}")))?;
        let response = check_status(response, endpoint)?;

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut parser = SseLineParser::new();
            let mut finished = false;
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| FocusError::Stream(format!("answer stream read failed: {e}")))?;
                for event in parser.push(&chunk) {
                    if let Some(answer) = decode_answer_event(&event)? {
                        finished = matches!(answer, AnswerEvent::Done { .. });
                        yield answer;
                        if finished {
                            break;
                        }
                    }
                }
                if finished {
                    break;
                }
            }
            if !finished {
                if let Some(event) = parser.flush() {
                    if let Some(answer) = decode_answer_event(&event)? {
                        yield answer;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Request synthesized audio for one sentence.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures and unexpected statuses.
    pub async fn synthesize_stream(&self, text: &str) -> Result<Option<AudioByteStream>> {
        let endpoint = &self.api.synthesize_path;
        let response = self
            .http
            .post(self.api.url(endpoint))
            .json(&SynthesizeRequest { text })
            .send()
            .await?;
        if is_no_content(response.status()) {
            debug!(status = response.status().as_u16(), "no synthesized audio for sentence");
            return Ok(None);
        }
        let response = check_status(response, endpoint)?;
        if response.content_length() == Some(0) {
            debug!("empty synthesis body");
            return Ok(None);
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FocusError::from));
        Ok(Some(Box::pin(stream)))
    }

    /// Fetch the filler clip, if the backend has one.
    ///
    /// # Errors
    ///
    /// Returns an error for transport failures and unexpected statuses.
    pub async fn filler_clip(&self) -> Result<Option<Bytes>> {
        let endpoint = &self.api.filler_path;
        let response = self.http.get(self.api.url(endpoint)).send().await?;
        if is_no_content(response.status()) {
            return Ok(None);
        }
        let response = check_status(response, endpoint)?;
        let clip = response.bytes().await?;
        Ok((!clip.is_empty()).then_some(clip))
    }

    /// Persist a finished turn.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the backend reports failure.
    pub async fn save_message(&self, request: &SaveMessageRequest) -> Result<SaveMessageResponse> {
        let endpoint = &self.api.save_message_path;
        let response = self
            .http
            .post(self.api.url(endpoint))
            .json(request)
            .send()
            .await?;
        let response = check_status(response, endpoint)?;
        let body: SaveMessageResponse = response.json().await?;
        if !body.success {
            return Err(FocusError::Persistence("backend rejected turn".to_owned()));
        }
        Ok(body)
    }

    /// Ask the backend to synthesize and store the full answer's audio.
    ///
    /// Returns the stored file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or no path comes back.
    pub async fn save_audio(&self, text: &str, message_id: &str) -> Result<String> {
        let endpoint = &self.api.save_audio_path;
        let response = self
            .http
            .post(self.api.url(endpoint))
            .json(&SaveAudioRequest { text, message_id })
            .send()
            .await?;
        let response = check_status(response, endpoint)?;
        let body: SaveAudioResponse = response.json().await?;
        match body.audio_file_path {
            Some(path) if body.success && !path.is_empty() => Ok(path),
            _ => Err(FocusError::Persistence(format!(
                "audio not saved for message {message_id}"
            ))),
        }
    }

    /// Register a freshly created session. Returns the title, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the backend reports failure.
    pub async fn create_session(&self, session_id: &str) -> Result<Option<String>> {
        let endpoint = &self.api.create_session_path;
        let response = self
            .http
            .post(self.api.url(endpoint))
            .json(&CreateSessionRequest {
                session_id,
                user_id: &self.api.user_id,
            })
            .send()
            .await?;
        let response = check_status(response, endpoint)?;
        let body: CreateSessionResponse = response.json().await?;
        if !body.success {
            return Err(FocusError::Persistence(format!(
                "session {session_id} not created"
            )));
        }
        Ok(body.title.filter(|t| !t.trim().is_empty()))
    }
}

#[async_trait]
impl SpeechSynthesizer for FocusClient {
    async fn synthesize(&self, text: &str) -> Result<Option<AudioByteStream>> {
        self.synthesize_stream(text).await
    }
}

#[async_trait]
impl FillerSource for FocusClient {
    async fn fetch_filler(&self) -> Result<Option<Bytes>> {
        self.filler_clip().await
    }
}

fn is_no_content(status: StatusCode) -> bool {
    status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND
}

fn check_status(response: reqwest::Response, endpoint: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(FocusError::Status {
            endpoint: endpoint.to_owned(),
            status: status.as_u16(),
        })
    }
}

/// Turn one SSE event into an answer event, skipping keepalives.
fn decode_answer_event(event: &SseEvent) -> Result<Option<AnswerEvent>> {
    if event.is_done() || event.data.trim().is_empty() {
        return Ok(None);
    }
    let payload: AnswerPayload = match serde_json::from_str(&event.data) {
        Ok(p) => p,
        Err(e) => {
            warn!("skipping malformed answer event: {e}");
            return Ok(None);
        }
    };
    if let Some(error) = payload.error {
        return Err(FocusError::Stream(error));
    }
    if payload.done {
        return Ok(Some(AnswerEvent::Done {
            full_text: payload.full_text.unwrap_or_default(),
        }));
    }
    Ok(payload
        .chunk
        .filter(|c| !c.is_empty())
        .map(AnswerEvent::Chunk))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event_type: None,
            data: data.to_owned(),
        }
    }

    #[test]
    fn decodes_chunk_and_done() {
        assert_eq!(
            decode_answer_event(&event(r#"{"chunk":"It is"}"#)).unwrap(),
            Some(AnswerEvent::Chunk("It is".into()))
        );
        assert_eq!(
            decode_answer_event(&event(r#"{"done":true,"full_text":"It is."}"#)).unwrap(),
            Some(AnswerEvent::Done {
                full_text: "It is.".into()
            })
        );
    }

    #[test]
    fn skips_sentinel_empty_and_malformed() {
        assert!(decode_answer_event(&event("[DONE]")).unwrap().is_none());
        assert!(decode_answer_event(&event(r#"{"chunk":""}"#)).unwrap().is_none());
        assert!(decode_answer_event(&event("not json")).unwrap().is_none());
    }

    #[test]
    fn error_payload_is_stream_error() {
        let err = decode_answer_event(&event(r#"{"error":"model overloaded"}"#)).unwrap_err();
        assert!(matches!(err, FocusError::Stream(msg) if msg == "model overloaded"));
    }
}

//! Realtime speech model session (Gemini Live, bidirectional WebSocket).
//!
//! The session streams 16 kHz PCM up and receives 24 kHz PCM plus tool
//! calls back. Wire shapes follow the `BidiGenerateContent` protocol; server
//! messages are parsed leniently from JSON values so protocol additions
//! never kill the session.

use crate::error::VoiceError;
use base64::Engine as _;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Events surfaced from the model to the voice worker.
#[derive(Debug)]
pub enum RealtimeEvent {
    /// Setup acknowledged; audio may flow.
    Ready,
    /// A chunk of 24 kHz mono s16le reply audio.
    Audio(Vec<u8>),
    /// The model was cut off by new user speech.
    Interrupted,
    /// The current reply finished naturally.
    TurnComplete,
    /// The model wants tools executed.
    ToolCall(Vec<FunctionCall>),
    /// The socket closed; the worker should wind down.
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Write half of a live session. The read half feeds the event channel.
pub struct RealtimeSession {
    sink: Mutex<WsSink>,
    reader: tokio::task::JoinHandle<()>,
}

impl RealtimeSession {
    /// Connect, send setup, and spawn the reader.
    ///
    /// Events (including `Ready`) arrive on the returned receiver.
    pub async fn connect(
        api_key: &str,
        model: &str,
        system_instruction: &str,
        tool_declarations: Vec<Value>,
    ) -> Result<(Self, mpsc::Receiver<RealtimeEvent>), VoiceError> {
        let url = format!("{LIVE_ENDPOINT}?key={api_key}");
        let (socket, _response) = connect_async(&url)
            .await
            .map_err(|e| VoiceError::WebSocket(e.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let setup = json!({
            "setup": {
                "model": format!("models/{model}"),
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                },
                "systemInstruction": {
                    "parts": [{"text": system_instruction}]
                },
                "tools": [{"functionDeclarations": tool_declarations}],
            }
        });
        sink.send(WsMessage::text(setup.to_string()))
            .await
            .map_err(|e| VoiceError::WebSocket(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let payload = match message {
                    Ok(WsMessage::Text(text)) => text.to_string(),
                    Ok(WsMessage::Binary(bytes)) => {
                        String::from_utf8_lossy(&bytes).into_owned()
                    }
                    Ok(WsMessage::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed".to_owned());
                        let _ = event_tx.send(RealtimeEvent::Closed(reason)).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        let _ = event_tx
                            .send(RealtimeEvent::Closed(error.to_string()))
                            .await;
                        break;
                    }
                };

                let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                    tracing::debug!("unparseable realtime message");
                    continue;
                };
                for event in parse_server_message(&value) {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok((
            Self {
                sink: Mutex::new(sink),
                reader,
            },
            event_rx,
        ))
    }

    async fn send(&self, value: Value) -> Result<(), VoiceError> {
        self.sink
            .lock()
            .await
            .send(WsMessage::text(value.to_string()))
            .await
            .map_err(|e| VoiceError::WebSocket(e.to_string()))
    }

    /// Stream one 16 kHz mono PCM frame to the model.
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<(), VoiceError> {
        self.send(json!({
            "realtimeInput": {
                "audio": {
                    "data": base64::engine::general_purpose::STANDARD.encode(pcm),
                    "mimeType": "audio/pcm;rate=16000",
                }
            }
        }))
        .await
    }

    /// Tell the model the user's audio stream ended (500 ms of silence).
    pub async fn audio_stream_end(&self) -> Result<(), VoiceError> {
        self.send(json!({"realtimeInput": {"audioStreamEnd": true}}))
            .await
    }

    /// Inject a text turn (typed input or back-channel tool notes).
    pub async fn send_text(&self, text: &str) -> Result<(), VoiceError> {
        self.send(json!({
            "clientContent": {
                "turns": [{"role": "user", "parts": [{"text": text}]}],
                "turnComplete": true,
            }
        }))
        .await
    }

    /// Answer a tool call.
    pub async fn send_tool_response(
        &self,
        call: &FunctionCall,
        response: Value,
    ) -> Result<(), VoiceError> {
        self.send(json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": call.id,
                    "name": call.name,
                    "response": response,
                }]
            }
        }))
        .await
    }

    /// Close the socket and stop the reader.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
        let _ = sink.close().await;
        self.reader.abort();
    }
}

/// Decode one server message into zero or more events.
fn parse_server_message(value: &Value) -> Vec<RealtimeEvent> {
    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(RealtimeEvent::Ready);
    }

    if let Some(content) = value.get("serverContent") {
        if content["interrupted"].as_bool() == Some(true) {
            events.push(RealtimeEvent::Interrupted);
        }
        if let Some(parts) = content["modelTurn"]["parts"].as_array() {
            for part in parts {
                let Some(data) = part["inlineData"]["data"].as_str() else {
                    continue;
                };
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(bytes) => events.push(RealtimeEvent::Audio(bytes)),
                    Err(error) => {
                        // Corrupted frames are dropped, never fatal.
                        tracing::debug!(%error, "dropping undecodable audio frame");
                    }
                }
            }
        }
        if content["turnComplete"].as_bool() == Some(true) {
            events.push(RealtimeEvent::TurnComplete);
        }
    }

    if let Some(calls) = value["toolCall"]["functionCalls"].as_array() {
        let calls: Vec<FunctionCall> = calls
            .iter()
            .filter_map(|call| {
                Some(FunctionCall {
                    id: call["id"].as_str().unwrap_or_default().to_owned(),
                    name: call["name"].as_str()?.to_owned(),
                    args: call.get("args").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        if !calls.is_empty() {
            events.push(RealtimeEvent::ToolCall(calls));
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_complete_maps_to_ready() {
        let events = parse_server_message(&json!({"setupComplete": {}}));
        assert!(matches!(events.as_slice(), [RealtimeEvent::Ready]));
    }

    #[test]
    fn model_turn_audio_is_decoded() {
        let data = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        let message = json!({
            "serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": data}}
            ]}}
        });
        let events = parse_server_message(&message);
        match events.as_slice() {
            [RealtimeEvent::Audio(bytes)] => assert_eq!(bytes, &vec![1, 2, 3, 4]),
            other => panic!("expected audio event, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_audio_is_dropped_silently() {
        let message = json!({
            "serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"data": "!!not-base64!!"}}
            ]}}
        });
        assert!(parse_server_message(&message).is_empty());
    }

    #[test]
    fn interruption_and_turn_complete_are_separate_events() {
        let message = json!({
            "serverContent": {"interrupted": true, "turnComplete": true}
        });
        let events = parse_server_message(&message);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RealtimeEvent::Interrupted));
        assert!(matches!(events[1], RealtimeEvent::TurnComplete));
    }

    #[test]
    fn tool_calls_parse_with_args() {
        let message = json!({
            "toolCall": {"functionCalls": [
                {"id": "fc_1", "name": "search_files", "args": {"query": "main"}}
            ]}
        });
        let events = parse_server_message(&message);
        match events.as_slice() {
            [RealtimeEvent::ToolCall(calls)] => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "search_files");
                assert_eq!(calls[0].args["query"], "main");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }
}

//! The per-guild realtime voice worker.
//!
//! Owns the model session and both audio directions. Communicates with the
//! Discord side exclusively through typed messages: decoded user audio in,
//! encoded Opus packets and speaking-state changes out. No shared memory
//! beyond the packet bytes themselves.

use crate::state::SharedState;
use crate::voice::audio::{
    downmix_48k_stereo_to_16k_mono, i16_to_pcm_bytes, pcm_bytes_to_i16,
    upsample_24k_mono_to_48k_stereo, Framer, PacketQueue, MODEL_FRAME_BYTES,
};
use crate::voice::realtime::{FunctionCall, RealtimeEvent, RealtimeSession};
use crate::voice::tools;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// One Opus frame: 20 ms of 48 kHz stereo, 960 samples per channel.
const OPUS_FRAME_SAMPLES: usize = 960 * 2;

/// Paced sender tick.
const PACE_INTERVAL: Duration = Duration::from_millis(20);

/// Empty ticks while speaking before the worker reports silence.
const SILENCE_TICKS_BEFORE_STOP: u32 = 3;

/// Bounded drain after a stop request.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages from the Discord side into the worker.
#[derive(Debug)]
pub enum WorkerInput {
    /// A user started speaking; a fresh capture session begins.
    CaptureStart { capture: u64 },
    /// One 20 ms tick of decoded 48 kHz stereo PCM.
    Audio { capture: u64, pcm: Vec<i16> },
    /// 500 ms of silence ended the capture.
    CaptureEnd { capture: u64 },
    /// Typed text routed into the voice conversation.
    Text(String),
    /// Barge-in: drop any queued reply audio.
    Interrupt,
    /// Tear the worker down.
    Stop,
}

/// Messages from the worker back to the Discord side.
#[derive(Debug)]
pub enum WorkerOutput {
    /// Model session is up.
    Ready,
    /// One encoded Opus packet, pre-paced at 20 ms.
    Packet(Vec<u8>),
    StartSpeaking,
    StopSpeaking,
    /// The model was interrupted; stop playback immediately.
    InterruptSpeaking,
    ToolCompleted { name: String },
    /// Terminal failure; the connection should be cleaned up.
    Error(String),
}

pub struct WorkerConfig {
    pub api_key: String,
    pub model: String,
    pub directory: PathBuf,
    /// Optional raw PCM capture for debugging.
    pub debug_audio_path: Option<PathBuf>,
}

const SYSTEM_INSTRUCTION: &str = "You are a hands-free voice interface to a coding agent working \
in the user's project. Keep spoken replies short and conversational. Use the tools to drive the \
agent: submit prompts, check its answers, search files. When the agent finishes something, \
summarize the outcome out loud instead of reading code verbatim.";

/// Run the worker until `Stop`, the model closes, or the input side hangs up.
pub async fn run(
    state: SharedState,
    config: WorkerConfig,
    mut input_rx: mpsc::Receiver<WorkerInput>,
    output_tx: mpsc::Sender<WorkerOutput>,
) {
    let (session, mut events) = match RealtimeSession::connect(
        &config.api_key,
        &config.model,
        SYSTEM_INSTRUCTION,
        tools::declarations(),
    )
    .await
    {
        Ok(connected) => connected,
        Err(error) => {
            let _ = output_tx.send(WorkerOutput::Error(error.to_string())).await;
            return;
        }
    };

    let mut encoder = match opus::Encoder::new(48_000, opus::Channels::Stereo, opus::Application::Audio)
    {
        Ok(encoder) => encoder,
        Err(error) => {
            session.close().await;
            let _ = output_tx
                .send(WorkerOutput::Error(format!("opus encoder: {error}")))
                .await;
            return;
        }
    };

    let mut debug_log = config.debug_audio_path.as_ref().and_then(|path| {
        std::fs::File::create(path)
            .map_err(|error| tracing::warn!(%error, "debug audio log unavailable"))
            .ok()
    });

    // Tool calls run off-loop so long agent turns never stall the audio.
    let (tool_tx, mut tool_rx) =
        mpsc::channel::<(FunctionCall, Value, Option<String>)>(16);

    let mut current_capture: u64 = 0;
    let mut framer = Framer::new(MODEL_FRAME_BYTES);
    let mut queue = PacketQueue::new();
    let mut pending_pcm: Vec<i16> = Vec::new();
    let mut speaking = false;
    let mut empty_ticks: u32 = 0;
    let mut pace = tokio::time::interval(PACE_INTERVAL);
    pace.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = input_rx.recv() => {
                match message {
                    Some(WorkerInput::CaptureStart { capture }) => {
                        current_capture = capture;
                        framer.flush();
                    }
                    Some(WorkerInput::Audio { capture, pcm }) => {
                        // Frames from a previous capture race the silence
                        // cutoff; they are stale, not user speech.
                        if capture != current_capture {
                            continue;
                        }
                        let mono = downmix_48k_stereo_to_16k_mono(&pcm);
                        let bytes = i16_to_pcm_bytes(&mono);
                        if let Some(log) = debug_log.as_mut() {
                            use std::io::Write as _;
                            let _ = log.write_all(&bytes);
                        }
                        for frame in framer.push(&bytes) {
                            if let Err(error) = session.send_audio(&frame).await {
                                tracing::warn!(%error, "failed to stream audio frame");
                            }
                        }
                    }
                    Some(WorkerInput::CaptureEnd { capture }) => {
                        if capture != current_capture {
                            continue;
                        }
                        framer.flush();
                        if let Err(error) = session.audio_stream_end().await {
                            tracing::warn!(%error, "failed to send audio stream end");
                        }
                    }
                    Some(WorkerInput::Text(text)) => {
                        if let Err(error) = session.send_text(&text).await {
                            tracing::warn!(%error, "failed to send text input");
                        }
                    }
                    Some(WorkerInput::Interrupt) => {
                        queue.clear();
                        pending_pcm.clear();
                        if speaking {
                            speaking = false;
                            let _ = output_tx.send(WorkerOutput::InterruptSpeaking).await;
                        }
                    }
                    Some(WorkerInput::Stop) | None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Some(RealtimeEvent::Ready) => {
                        let _ = output_tx.send(WorkerOutput::Ready).await;
                    }
                    Some(RealtimeEvent::Audio(bytes)) => {
                        let mono = pcm_bytes_to_i16(&bytes);
                        pending_pcm.extend(upsample_24k_mono_to_48k_stereo(&mono));
                        encode_pending(&mut encoder, &mut pending_pcm, &mut queue);
                    }
                    Some(RealtimeEvent::Interrupted) => {
                        queue.clear();
                        pending_pcm.clear();
                        if speaking {
                            speaking = false;
                            let _ = output_tx.send(WorkerOutput::InterruptSpeaking).await;
                        }
                    }
                    Some(RealtimeEvent::TurnComplete) => {
                        // The pacer drains what is queued; nothing to do.
                    }
                    Some(RealtimeEvent::ToolCall(calls)) => {
                        for call in calls {
                            let state = state.clone();
                            let directory = config.directory.clone();
                            let tool_tx = tool_tx.clone();
                            tokio::spawn(async move {
                                let (result, summary) =
                                    tools::execute(&state, &directory, &call).await;
                                let _ = tool_tx.send((call, result, summary)).await;
                            });
                        }
                    }
                    Some(RealtimeEvent::Closed(reason)) => {
                        let _ = output_tx.send(WorkerOutput::Error(reason)).await;
                        break;
                    }
                    None => break,
                }
            }
            Some((call, result, summary)) = tool_rx.recv() => {
                if let Err(error) = session.send_tool_response(&call, result).await {
                    tracing::warn!(%error, tool = %call.name, "tool response failed");
                }
                if let Some(summary) = summary {
                    let note = format!("The coding agent replied:\n{summary}");
                    if let Err(error) = session.send_text(&note).await {
                        tracing::warn!(%error, "tool back-channel note failed");
                    }
                }
                let _ = output_tx
                    .send(WorkerOutput::ToolCompleted { name: call.name.clone() })
                    .await;
            }
            _ = pace.tick() => {
                match queue.pop() {
                    Some(packet) => {
                        if !speaking {
                            speaking = true;
                            let _ = output_tx.send(WorkerOutput::StartSpeaking).await;
                        }
                        empty_ticks = 0;
                        let _ = output_tx.send(WorkerOutput::Packet(packet)).await;
                    }
                    None if speaking => {
                        empty_ticks += 1;
                        if empty_ticks >= SILENCE_TICKS_BEFORE_STOP
                            && pending_pcm.len() < OPUS_FRAME_SAMPLES
                        {
                            speaking = false;
                            empty_ticks = 0;
                            let _ = output_tx.send(WorkerOutput::StopSpeaking).await;
                        }
                    }
                    None => {}
                }
            }
        }
    }

    // Bounded drain so the tail of a reply is not cut off mid-word.
    let drain = async {
        let mut pace = tokio::time::interval(PACE_INTERVAL);
        while let Some(packet) = queue.pop() {
            pace.tick().await;
            if output_tx.send(WorkerOutput::Packet(packet)).await.is_err() {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;

    if speaking {
        let _ = output_tx.send(WorkerOutput::StopSpeaking).await;
    }
    session.close().await;
    tracing::info!(directory = %config.directory.display(), "voice worker stopped");
}

/// Encode every whole 20 ms frame waiting in `pending`.
fn encode_pending(
    encoder: &mut opus::Encoder,
    pending: &mut Vec<i16>,
    queue: &mut PacketQueue,
) {
    while pending.len() >= OPUS_FRAME_SAMPLES {
        let frame: Vec<i16> = pending.drain(..OPUS_FRAME_SAMPLES).collect();
        let mut packet = vec![0u8; 4000];
        match encoder.encode(&frame, &mut packet) {
            Ok(written) => {
                packet.truncate(written);
                queue.push(packet);
            }
            Err(error) => {
                // A bad frame is dropped; the stream keeps going.
                tracing::debug!(%error, "opus encode failed");
            }
        }
    }
}

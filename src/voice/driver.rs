//! Songbird glue: voice receive events in, paced Opus packets out.
//!
//! RX uses songbird's decoded `VoiceTick` stream (20 ms of 48 kHz stereo per
//! speaking user). TX feeds the worker's pre-encoded, pre-paced packets to
//! the driver as a live DCA stream, so packets pass through without a
//! decode/re-encode round trip.

use crate::voice::worker::{WorkerInput, WorkerOutput};
use serenity::all::ChannelId;
use serenity::http::Http;
use songbird::events::context_data::VoiceTick;
use songbird::input::core::io::MediaSource;
use songbird::input::{AudioStream, Input, LiveInput};
use songbird::model::payload::Speaking;
use songbird::tracks::TrackHandle;
use songbird::{Call, CoreEvent, Event, EventContext, EventHandler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

/// 20 ms ticks of silence before a capture session ends (500 ms).
const SILENCE_TICKS: u32 = 25;

/// Register the receive handlers on a joined call.
pub async fn install_rx(call: &Arc<Mutex<Call>>, input_tx: mpsc::Sender<WorkerInput>) {
    let receiver = Receiver::new(input_tx);
    let mut call = call.lock().await;
    call.add_global_event(Event::Core(CoreEvent::SpeakingStateUpdate), receiver.clone());
    call.add_global_event(Event::Core(CoreEvent::VoiceTick), receiver);
}

struct CaptureState {
    id: u64,
    silent_ticks: u32,
}

#[derive(Clone)]
struct Receiver {
    inner: Arc<ReceiverState>,
}

struct ReceiverState {
    input_tx: mpsc::Sender<WorkerInput>,
    /// SSRC → Discord user, learned from speaking-state updates.
    users: StdMutex<HashMap<u32, u64>>,
    /// SSRC → running capture session.
    captures: StdMutex<HashMap<u32, CaptureState>>,
    next_capture: AtomicU64,
}

impl Receiver {
    fn new(input_tx: mpsc::Sender<WorkerInput>) -> Self {
        Self {
            inner: Arc::new(ReceiverState {
                input_tx,
                users: StdMutex::new(HashMap::new()),
                captures: StdMutex::new(HashMap::new()),
                next_capture: AtomicU64::new(1),
            }),
        }
    }

    fn handle_tick(&self, tick: &VoiceTick) {
        let state = &self.inner;
        let mut captures = state.captures.lock().expect("capture lock poisoned");

        for (ssrc, data) in &tick.speaking {
            // Only forward audio for sources we have identified; packets can
            // arrive before the speaking-state update that names the user.
            if !self
                .inner
                .users
                .lock()
                .expect("ssrc map lock poisoned")
                .contains_key(ssrc)
            {
                continue;
            }
            let capture = captures.entry(*ssrc).or_insert_with(|| {
                let id = state.next_capture.fetch_add(1, Ordering::Relaxed);
                let _ = state.input_tx.try_send(WorkerInput::CaptureStart { capture: id });
                CaptureState { id, silent_ticks: 0 }
            });
            capture.silent_ticks = 0;

            if let Some(pcm) = &data.decoded_voice {
                // Realtime path: drop on backpressure rather than lag.
                let _ = state.input_tx.try_send(WorkerInput::Audio {
                    capture: capture.id,
                    pcm: pcm.clone(),
                });
            }
        }

        let mut ended: Vec<u32> = Vec::new();
        for (ssrc, capture) in captures.iter_mut() {
            if tick.speaking.contains_key(ssrc) {
                continue;
            }
            capture.silent_ticks += 1;
            if capture.silent_ticks >= SILENCE_TICKS {
                let _ = state
                    .input_tx
                    .try_send(WorkerInput::CaptureEnd { capture: capture.id });
                ended.push(*ssrc);
            }
        }
        for ssrc in ended {
            captures.remove(&ssrc);
        }
    }
}

#[serenity::async_trait]
impl EventHandler for Receiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(Speaking { ssrc, user_id, .. }) => {
                if let Some(user) = user_id {
                    self.inner
                        .users
                        .lock()
                        .expect("ssrc map lock poisoned")
                        .insert(*ssrc, user.0);
                }
            }
            EventContext::VoiceTick(tick) => self.handle_tick(tick),
            _ => {}
        }
        None
    }
}

/// Consume worker output: feed packets into the live DCA ring, toggle
/// playback on speaking-state changes, and surface worker errors into the
/// project text channel.
pub async fn run_tx(
    call: Arc<Mutex<Call>>,
    mut output_rx: mpsc::Receiver<WorkerOutput>,
    http: Arc<Http>,
    error_channel: Option<ChannelId>,
) {
    let ring = Arc::new(PacketRing::new());
    let mut track: Option<TrackHandle> = None;

    while let Some(message) = output_rx.recv().await {
        match message {
            WorkerOutput::Ready => {
                tracing::info!("realtime voice session ready");
            }
            WorkerOutput::Packet(packet) => {
                ring.push_frame(&packet);
            }
            WorkerOutput::StartSpeaking => {
                match &track {
                    Some(handle) => {
                        let _ = handle.play();
                    }
                    None => {
                        let stream = AudioStream {
                            input: Box::new(RingReader::new(ring.clone())) as Box<dyn MediaSource>,
                            hint: Some(dca_hint()),
                        };
                        let input = Input::Live(LiveInput::Raw(stream), None);
                        let handle = call.lock().await.play_input(input);
                        track = Some(handle);
                    }
                }
            }
            WorkerOutput::StopSpeaking => {
                if let Some(handle) = &track {
                    let _ = handle.pause();
                }
            }
            WorkerOutput::InterruptSpeaking => {
                ring.clear();
                if let Some(handle) = &track {
                    let _ = handle.pause();
                }
            }
            WorkerOutput::ToolCompleted { name } => {
                tracing::debug!(tool = %name, "voice tool completed");
            }
            WorkerOutput::Error(message) => {
                tracing::error!(%message, "voice worker error");
                if let Some(channel) = error_channel {
                    let text = format!("✗ Voice session error: {message}");
                    let _ = channel.say(&http, text).await;
                }
                break;
            }
        }
    }

    ring.close();
    if let Some(handle) = track {
        let _ = handle.stop();
    }
}

fn dca_hint() -> songbird::input::core::probe::Hint {
    let mut hint = songbird::input::core::probe::Hint::new();
    hint.with_extension("dca");
    hint
}

/// Blocking byte ring carrying a DCA1 stream of Opus frames.
///
/// The writer side appends length-prefixed frames; the reader side is the
/// driver's decode thread, which blocks until bytes are available or the
/// ring is closed.
struct PacketRing {
    buffer: StdMutex<Vec<u8>>,
    available: Condvar,
    closed: AtomicBool,
}

impl PacketRing {
    fn new() -> Self {
        let ring = Self {
            buffer: StdMutex::new(Vec::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        };
        ring.write_header();
        ring
    }

    /// DCA1 header: magic, metadata length, metadata JSON.
    fn write_header(&self) {
        let metadata = serde_json::json!({
            "dca": {"version": 1},
            "opus": {"sample_rate": 48000, "channels": 2, "frame_size": 960},
        })
        .to_string();
        let mut buffer = self.buffer.lock().expect("ring lock poisoned");
        buffer.extend_from_slice(b"DCA1");
        buffer.extend_from_slice(&(metadata.len() as i32).to_le_bytes());
        buffer.extend_from_slice(metadata.as_bytes());
    }

    fn push_frame(&self, packet: &[u8]) {
        let mut buffer = self.buffer.lock().expect("ring lock poisoned");
        buffer.extend_from_slice(&(packet.len() as i16).to_le_bytes());
        buffer.extend_from_slice(packet);
        drop(buffer);
        self.available.notify_one();
    }

    /// Drop undelivered frames (barge-in).
    fn clear(&self) {
        self.buffer.lock().expect("ring lock poisoned").clear();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }
}

struct RingReader {
    ring: Arc<PacketRing>,
}

impl RingReader {
    fn new(ring: Arc<PacketRing>) -> Self {
        Self { ring }
    }
}

impl std::io::Read for RingReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let mut buffer = self.ring.buffer.lock().expect("ring lock poisoned");
        while buffer.is_empty() {
            if self.ring.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            buffer = self
                .ring
                .available
                .wait(buffer)
                .expect("ring lock poisoned");
        }
        let take = out.len().min(buffer.len());
        out[..take].copy_from_slice(&buffer[..take]);
        buffer.drain(..take);
        Ok(take)
    }
}

impl std::io::Seek for RingReader {
    fn seek(&mut self, _pos: std::io::SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "live stream",
        ))
    }
}

impl MediaSource for RingReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn ring_starts_with_a_dca_header() {
        let ring = Arc::new(PacketRing::new());
        ring.close();
        let mut reader = RingReader::new(ring);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"DCA1");
    }

    #[test]
    fn frames_are_length_prefixed() {
        let ring = Arc::new(PacketRing::new());
        ring.clear(); // drop the header for this test
        ring.push_frame(&[9, 8, 7]);
        ring.close();

        let mut reader = RingReader::new(ring);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, vec![3, 0, 9, 8, 7]);
    }

    #[test]
    fn closed_empty_ring_reads_eof() {
        let ring = Arc::new(PacketRing::new());
        ring.clear();
        ring.close();
        let mut reader = RingReader::new(ring);
        let mut buf = [0u8; 16];
        assert_eq!(std::io::Read::read(&mut reader, &mut buf).unwrap(), 0);
    }
}

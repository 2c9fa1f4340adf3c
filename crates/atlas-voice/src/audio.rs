//! Audio I/O seams: microphone frames in, PCM chunks out.
//!
//! [`FrameSource`] and [`AudioSink`] are what the capture loop and the playback
//! controller talk to. The cpal / rodio adapters below are the production
//! implementations; tests substitute scripted fakes.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one attempt to read a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    /// Exactly `frame_size` mono samples.
    Frame(Vec<f32>),
    /// Samples were lost upstream; the partial frame was discarded.
    Overflowed,
    /// Nothing arrived in time.
    Timeout,
}

/// Fixed-size microphone frames.
pub trait FrameSource {
    fn read_frame(&mut self, timeout: Duration) -> VoiceResult<FrameRead>;
}

/// Output device. `write` enqueues a chunk and returns without waiting for it
/// to play.
pub trait AudioSink: Send {
    fn write(&mut self, chunk: &[f32], sample_rate: u32) -> VoiceResult<()>;

    /// Chunks accepted but not yet fully played.
    fn queued(&self) -> usize;

    /// Drop everything queued and leave the device ready for new audio.
    fn abort(&mut self);
}

/// Callback batches buffered between the cpal thread and the capture loop.
const CAPTURE_CHANNEL_DEPTH: usize = 64;

/// Default input device via cpal, re-framed to `frame_size` samples.
///
/// The cpal stream is `!Send` on some hosts, so build this on the thread that
/// reads from it.
pub struct MicrophoneSource {
    _stream: Stream,
    rx: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    frame_size: usize,
    overflowed: Arc<AtomicBool>,
    drops: Arc<AtomicU64>,
}

impl MicrophoneSource {
    pub fn open(sample_rate: u32, frame_size: usize) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            sample_rate,
            frame_size,
            "opening microphone"
        );
        debug!(default = ?device.default_input_config()?, "device default input config");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx): (SyncSender<Vec<f32>>, Receiver<Vec<f32>>) = mpsc::sync_channel(CAPTURE_CHANNEL_DEPTH);
        let overflowed = Arc::new(AtomicBool::new(false));
        let drops = Arc::new(AtomicU64::new(0));
        let cb_overflowed = overflowed.clone();
        let cb_drops = drops.clone();

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| match tx.try_send(data.to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    cb_overflowed.store(true, Ordering::Relaxed);
                    cb_drops.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            },
            |err| warn!(error = %err, "audio input stream error"),
            None,
        )?;
        stream.play()?;

        Ok(Self {
            _stream: stream,
            rx,
            pending: Vec::with_capacity(frame_size * 2),
            frame_size,
            overflowed,
            drops,
        })
    }

    /// Callback batches dropped because the reader fell behind.
    pub fn dropped_batches(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl FrameSource for MicrophoneSource {
    fn read_frame(&mut self, timeout: Duration) -> VoiceResult<FrameRead> {
        loop {
            if self.overflowed.swap(false, Ordering::Relaxed) {
                self.pending.clear();
                return Ok(FrameRead::Overflowed);
            }
            if self.pending.len() >= self.frame_size {
                let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
                return Ok(FrameRead::Frame(frame));
            }
            match self.rx.recv_timeout(timeout) {
                Ok(batch) => self.pending.extend_from_slice(&batch),
                Err(RecvTimeoutError::Timeout) => return Ok(FrameRead::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(VoiceError::AudioStream("input stream closed".to_string()))
                }
            }
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        let dropped = self.dropped_batches();
        if dropped > 0 {
            warn!(dropped, "microphone closed; input batches were dropped while capture lagged");
        } else {
            debug!("microphone closed");
        }
    }
}

/// Default output device via rodio.
///
/// `rodio::OutputStream` is `!Send`, so a dedicated thread owns it for the
/// lifetime of this sink; only the `Sink` (which is `Send + Sync`) crosses
/// over. Dropping the `RodioSink` lets the device thread exit.
pub struct RodioSink {
    sink: Arc<Sink>,
    _keep_alive: mpsc::Sender<()>,
}

impl RodioSink {
    pub fn open() -> VoiceResult<Self> {
        let (init_tx, init_rx) = mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (keep_tx, keep_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("atlas-playback-device".into())
            .spawn(move || {
                let opened = OutputStream::try_default()
                    .map_err(|e| VoiceError::Playback(e.to_string()))
                    .and_then(|(stream, handle)| {
                        Sink::try_new(&handle)
                            .map(|sink| (stream, Arc::new(sink)))
                            .map_err(|e| VoiceError::Playback(e.to_string()))
                    });
                match opened {
                    Ok((_stream, sink)) => {
                        if init_tx.send(Ok(sink)).is_err() {
                            return;
                        }
                        // Blocks until every keep-alive sender is gone.
                        let _ = keep_rx.recv();
                        debug!("playback device thread exiting");
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| VoiceError::Playback(format!("failed to spawn playback thread: {}", e)))?;

        let sink = init_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread died during init".to_string()))??;
        info!("playback sink ready");

        Ok(Self {
            sink,
            _keep_alive: keep_tx,
        })
    }
}

impl AudioSink for RodioSink {
    fn write(&mut self, chunk: &[f32], sample_rate: u32) -> VoiceResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.sink.append(SamplesBuffer::new(1, sample_rate, chunk.to_vec()));
        Ok(())
    }

    fn queued(&self) -> usize {
        self.sink.len()
    }

    fn abort(&mut self) {
        self.sink.clear();
        // clear() leaves the current source playing; skip it too.
        self.sink.skip_one();
        self.sink.play();
        debug!("playback sink aborted");
    }
}

/// Sink for text-only runs: accepts and discards audio.
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _chunk: &[f32], _sample_rate: u32) -> VoiceResult<()> {
        Ok(())
    }

    fn queued(&self) -> usize {
        0
    }

    fn abort(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_never_queues() {
        let mut sink = NullSink;
        sink.write(&[0.1; 160], 16_000).unwrap();
        assert_eq!(sink.queued(), 0);
        sink.abort();
    }

    #[test]
    #[ignore = "requires an audio input device"]
    fn microphone_delivers_frames() {
        let mut mic = MicrophoneSource::open(16_000, 512).unwrap();
        let mut frames = 0;
        for _ in 0..50 {
            if let FrameRead::Frame(f) = mic.read_frame(Duration::from_millis(200)).unwrap() {
                assert_eq!(f.len(), 512);
                frames += 1;
            }
        }
        assert!(frames > 0);
    }

    #[test]
    fn list_devices_does_not_panic() {
        if let Ok(devices) = MicrophoneSource::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}

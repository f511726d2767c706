//! Local media: one microphone stream, mute control, speech activity.
//!
//! The microphone starts muted. Muting flips the track's `enabled` flag and
//! nothing else: the track stays live and attached to its sender, so a mute
//! toggle never forces renegotiation.
//!
//! Speech detection mirrors a browser `AnalyserNode` feeding
//! `getByteFrequencyData`: a windowed FFT of the latest samples, bin
//! magnitudes mapped from [-100 dB, -30 dB] onto 0..=255, averaged. The
//! local side is "speaking" when that average exceeds the threshold and the
//! mic is unmuted. The signal is advisory and only feeds the UI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::MediaError;

/// Lower bound of the analyser's decibel range.
const MIN_DECIBELS: f32 = -100.0;
/// Upper bound of the analyser's decibel range.
const MAX_DECIBELS: f32 = -30.0;

// ───────────────────────────────────────────────────────────────────
// Tracks and streams
// ───────────────────────────────────────────────────────────────────

/// `MediaStreamTrack.readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

#[derive(Debug)]
struct TrackState {
    id: String,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// A local audio track. Clones share state.
#[derive(Debug, Clone)]
pub struct LocalAudioTrack {
    state: Arc<TrackState>,
}

impl LocalAudioTrack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            state: Arc::new(TrackState {
                id: Uuid::new_v4().to_string(),
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    pub fn enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.state.ended.load(Ordering::SeqCst) {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    /// End the track. Irreversible.
    pub fn stop(&self) {
        self.state.ended.store(true, Ordering::SeqCst);
    }
}

/// Raw PCM access to a capture device, used for amplitude analysis.
pub trait AudioTap: Send + Sync {
    /// Fill `out` with the most recent samples in [-1.0, 1.0].
    fn read_frame(&self, out: &mut [f32]);
}

/// A captured microphone stream.
#[derive(Clone)]
pub struct LocalStream {
    pub id: String,
    pub track: LocalAudioTrack,
    pub tap: Arc<dyn AudioTap>,
}

/// `navigator.mediaDevices`.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request one audio input stream.
    async fn get_user_media(&self) -> Result<LocalStream, MediaError>;
}

// ───────────────────────────────────────────────────────────────────
// Synthetic microphone
// ───────────────────────────────────────────────────────────────────

/// What a synthetic microphone is currently "hearing".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    /// Broadband noise of the given peak amplitude
    Noise { amplitude: f32 },
}

struct Generator {
    signal: Signal,
    seed: u32,
}

impl Generator {
    fn next_sample(&mut self) -> f32 {
        match self.signal {
            Signal::Silence => 0.0,
            Signal::Noise { amplitude } => {
                // xorshift32
                self.seed ^= self.seed << 13;
                self.seed ^= self.seed >> 17;
                self.seed ^= self.seed << 5;
                let unit = self.seed as f32 / u32::MAX as f32;
                (unit * 2.0 - 1.0) * amplitude
            }
        }
    }
}

/// In-process microphone whose signal tests can drive.
#[derive(Clone)]
pub struct SyntheticMicrophone {
    generator: Arc<Mutex<Generator>>,
    failure: Option<MediaError>,
}

impl SyntheticMicrophone {
    pub fn new() -> Self {
        Self {
            generator: Arc::new(Mutex::new(Generator {
                signal: Signal::Silence,
                seed: 0x9E37_79B9,
            })),
            failure: None,
        }
    }

    /// A device set whose `get_user_media` always fails with `err`.
    pub fn failing(err: MediaError) -> Self {
        Self {
            failure: Some(err),
            ..Self::new()
        }
    }

    pub fn set_signal(&self, signal: Signal) {
        self.generator.lock().signal = signal;
    }
}

impl Default for SyntheticMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioTap for SyntheticMicrophone {
    fn read_frame(&self, out: &mut [f32]) {
        let mut generator = self.generator.lock();
        for sample in out.iter_mut() {
            *sample = generator.next_sample();
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticMicrophone {
    async fn get_user_media(&self) -> Result<LocalStream, MediaError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(LocalStream {
            id: Uuid::new_v4().to_string(),
            track: LocalAudioTrack::new("synthetic microphone"),
            tap: Arc::new(self.clone()),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Local media controller
// ───────────────────────────────────────────────────────────────────

/// Owns the single local microphone stream of a session.
pub struct LocalMedia {
    stream: Option<LocalStream>,
}

impl LocalMedia {
    /// Acquire the microphone, muted.
    ///
    /// A missing device or denied permission is not fatal: voice is
    /// disabled and the rest of the session is unaffected.
    pub async fn acquire(devices: &dyn MediaDevices) -> Self {
        match devices.get_user_media().await {
            Ok(stream) => {
                stream.track.set_enabled(false);
                log::info!(
                    target: "tandem::track",
                    "local mic {} acquired, enabled={}",
                    stream.track.id(),
                    stream.track.enabled()
                );
                Self {
                    stream: Some(stream),
                }
            }
            Err(e) => {
                log::warn!(target: "tandem::track", "microphone unavailable, voice disabled: {e}");
                Self { stream: None }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn track(&self) -> Option<&LocalAudioTrack> {
        self.stream.as_ref().map(|s| &s.track)
    }

    /// Muted when there is no microphone at all.
    pub fn is_muted(&self) -> bool {
        self.track().map_or(true, |t| !t.enabled())
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(track) = self.track() {
            track.set_enabled(!muted);
            log::info!(
                target: "tandem::track",
                "mic {} -> enabled={}",
                if muted { "muted" } else { "unmuted" },
                track.enabled()
            );
        }
    }

    /// Flip mute; returns the new muted state.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.is_muted();
        self.set_muted(muted);
        self.is_muted()
    }

    /// Stop every track. Called once on teardown.
    pub fn stop(&self) {
        if let Some(track) = self.track() {
            track.stop();
            log::debug!(target: "tandem::track", "local mic {} stopped", track.id());
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Speech detection
// ───────────────────────────────────────────────────────────────────

/// FFT analyser producing `getByteFrequencyData`-style levels.
pub struct SpeechDetector {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    threshold: f32,
}

impl SpeechDetector {
    pub fn new(fft_size: usize, threshold: f32) -> Self {
        let fft_size = fft_size.max(2);
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        // Hamming window
        let window = (0..fft_size)
            .map(|i| {
                0.54 - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / (fft_size - 1) as f32).cos()
            })
            .collect();
        Self {
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            threshold,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Byte levels of the `fft_size / 2` frequency bins of `samples`.
    ///
    /// `samples` shorter than the FFT size are zero-padded.
    pub fn frequency_levels(&mut self, samples: &[f32]) -> Vec<u8> {
        let n = self.fft_size();
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = samples.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        self.buffer
            .iter()
            .take(n / 2)
            .map(|c| {
                let magnitude = c.norm() / n as f32;
                if magnitude <= 0.0 {
                    return 0;
                }
                let db = 20.0 * magnitude.log10();
                let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Mean byte level over all bins.
    pub fn average_level(&mut self, samples: &[f32]) -> f32 {
        let levels = self.frequency_levels(samples);
        if levels.is_empty() {
            return 0.0;
        }
        levels.iter().map(|&l| l as f32).sum::<f32>() / levels.len() as f32
    }

    pub fn is_speaking(&mut self, samples: &[f32], muted: bool) -> bool {
        !muted && self.average_level(samples) > self.threshold
    }
}

/// Sample the stream on the configured cadence and publish speaking changes.
///
/// The returned handle must be aborted on teardown.
pub fn spawn_speech_monitor(
    stream: &LocalStream,
    config: &SessionConfig,
    speaking: watch::Sender<bool>,
) -> JoinHandle<()> {
    let tap = stream.tap.clone();
    let track = stream.track.clone();
    let mut detector = SpeechDetector::new(config.fft_size, config.speech_threshold);
    let cadence = config.speech_sample_interval();

    tokio::spawn(async move {
        let mut frame = vec![0.0f32; detector.fft_size()];
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if track.ready_state() == ReadyState::Ended {
                break;
            }
            tap.read_frame(&mut frame);
            let now = detector.is_speaking(&frame, !track.enabled());
            speaking.send_if_modified(|current| {
                if *current != now {
                    *current = now;
                    true
                } else {
                    false
                }
            });
            if speaking.is_closed() {
                break;
            }
        }
    })
}

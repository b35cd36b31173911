//! Time-synchronized duplex capture
//!
//! A [`DuplexSession`] plays one stimulus and records the room for a fixed
//! duration on the same device clock:
//!
//! - the playback path (spawned thread) pushes the stimulus into the device
//!   ring one chunk at a time and waits until the device has rendered it all
//! - the capture path (calling thread) drains the device ring into a buffer of
//!   exactly `capture_duration * sample_rate` samples
//!
//! Both paths wait on one shared barrier before their first transfer. Any
//! failure stops the device and discards the partial recording; callers only
//! ever see a complete [`CaptureSession`] or an error.

use super::engine::{DuplexDevice, DuplexStreams, FrameClock};
use super::signal::{Waveform, MAX_DURATION_SECS};
use crossbeam_channel::Receiver;
use ringbuf::traits::{Consumer, Observer, Producer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Sleep between polls of an empty or full ring
const POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Errors that abort a capture session
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Sample rate mismatch: expected {expected}, got {actual}")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Capture overrun: {0} input frames lost")]
    Overrun(u64),

    #[error("{stage} did not complete within {timeout_ms} ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    #[error("Transfer aborted after the other stream failed")]
    PeerAborted,

    #[error("Session cancelled")]
    Cancelled,

    #[error("A capture session is already in flight")]
    Busy,
}

/// Transfer tuning for a [`DuplexSession`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames moved per transfer step
    pub chunk_frames: usize,
    /// Capacity of the playback and capture rings in samples
    pub ring_capacity: usize,
    /// Time allowed on top of the session length before a transfer times out
    pub deadline_slack: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 256,
            ring_capacity: 32768,
            deadline_slack: Duration::from_secs(2),
        }
    }
}

/// A completed measurement: the stimulus that was played and what was heard
///
/// Both waveforms share a sample rate. Only constructed once capture finished.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    stimulus: Waveform,
    recorded: Waveform,
}

impl CaptureSession {
    pub fn stimulus(&self) -> &Waveform {
        &self.stimulus
    }

    pub fn recorded(&self) -> &Waveform {
        &self.recorded
    }

    pub fn sample_rate(&self) -> u32 {
        self.recorded.sample_rate()
    }

    /// Split into (stimulus, recorded)
    pub fn into_parts(self) -> (Waveform, Waveform) {
        (self.stimulus, self.recorded)
    }
}

/// Checks shared by both transfer paths between chunks
struct TransferGuard<'a> {
    cancel: &'a AtomicBool,
    abort: &'a AtomicBool,
    errors: &'a Receiver<String>,
    deadline: Instant,
    budget: Duration,
}

impl TransferGuard<'_> {
    fn check(&self) -> Result<(), SessionError> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(SessionError::Cancelled);
        }
        if self.abort.load(Ordering::Acquire) {
            return Err(SessionError::PeerAborted);
        }
        if let Ok(message) = self.errors.try_recv() {
            return Err(SessionError::Stream(message));
        }
        Ok(())
    }

    fn wait(&self, stage: &'static str) -> Result<(), SessionError> {
        if Instant::now() >= self.deadline {
            return Err(SessionError::Timeout {
                stage,
                timeout_ms: self.budget.as_millis() as u64,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
        Ok(())
    }
}

/// Drives one playback + capture run on a [`DuplexDevice`]
///
/// `run` takes `&mut self`, so a device can only be in one session at a time.
///
/// # Example
/// ```
/// use reverbmeter_core::audio::loopback::LoopbackDevice;
/// use reverbmeter_core::audio::session::DuplexSession;
/// use reverbmeter_core::audio::signal::StimulusGenerator;
///
/// let stimulus = StimulusGenerator::default()
///     .generate(8000, 200.0, 2000.0, 0.25)
///     .unwrap();
/// let mut session = DuplexSession::new(LoopbackDevice::new(8000).with_delay(10));
/// let capture = session.run(stimulus, 0.25).unwrap();
/// assert_eq!(capture.recorded().len(), 2000);
/// ```
pub struct DuplexSession<D: DuplexDevice> {
    device: D,
    config: SessionConfig,
    cancel: Arc<AtomicBool>,
}

impl<D: DuplexDevice> DuplexSession<D> {
    pub fn new(device: D) -> Self {
        Self::with_config(device, SessionConfig::default())
    }

    pub fn with_config(device: D, config: SessionConfig) -> Self {
        Self {
            device,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that aborts the running (and every later) session when raised
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn sample_rate(&self) -> u32 {
        self.device.sample_rate()
    }

    /// Play `stimulus` while recording `capture_duration` seconds
    ///
    /// The recording holds exactly `floor(capture_duration * sample_rate)`
    /// samples. Frames the device could not capture yet (input warm-up) are
    /// zeros at the start of the recording.
    ///
    /// # Errors
    /// Any [`SessionError`]; the device is stopped and nothing partial is
    /// returned.
    pub fn run(
        &mut self,
        stimulus: Waveform,
        capture_duration: f64,
    ) -> Result<CaptureSession, SessionError> {
        let sample_rate = self.device.sample_rate();
        if stimulus.sample_rate() != sample_rate {
            return Err(SessionError::SampleRateMismatch {
                expected: sample_rate,
                actual: stimulus.sample_rate(),
            });
        }
        if !capture_duration.is_finite() || capture_duration <= 0.0 {
            return Err(SessionError::InvalidParameter(format!(
                "capture duration must be positive, got {capture_duration}"
            )));
        }
        if capture_duration > MAX_DURATION_SECS {
            return Err(SessionError::InvalidParameter(format!(
                "capture duration {capture_duration} s exceeds {MAX_DURATION_SECS} s"
            )));
        }
        let capture_len = (sample_rate as f64 * capture_duration) as usize;
        if capture_len == 0 {
            return Err(SessionError::InvalidParameter(format!(
                "{capture_duration} s at {sample_rate} Hz yields no samples"
            )));
        }
        if self.cancel.load(Ordering::Acquire) {
            return Err(SessionError::Cancelled);
        }

        let span = capture_duration.max(stimulus.duration_secs());
        let budget = Duration::try_from_secs_f64(span)
            .ok()
            .and_then(|span| span.checked_add(self.config.deadline_slack))
            .filter(|&budget| Instant::now().checked_add(budget).is_some())
            .ok_or_else(|| {
                SessionError::InvalidParameter(format!(
                    "session deadline out of range: {span} s plus {:?} slack",
                    self.config.deadline_slack
                ))
            })?;

        let streams = self.device.start(self.config.ring_capacity)?;
        tracing::info!(
            device = %self.device.name(),
            stimulus_samples = stimulus.len(),
            capture_samples = capture_len,
            sample_rate,
            "Capture session started"
        );

        let result = self.transfer(&stimulus, capture_len, streams, budget);
        self.device.stop();

        match result {
            Ok(samples) => {
                tracing::info!(samples = samples.len(), "Capture session complete");
                Ok(CaptureSession {
                    stimulus,
                    recorded: Waveform::from_samples(samples, sample_rate),
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Capture session aborted, buffers discarded");
                Err(e)
            }
        }
    }

    fn transfer(
        &self,
        stimulus: &Waveform,
        capture_len: usize,
        streams: DuplexStreams,
        budget: Duration,
    ) -> Result<Vec<i16>, SessionError> {
        let DuplexStreams {
            playback,
            capture,
            clock,
            errors,
        } = streams;

        let barrier = Barrier::new(2);
        let abort = AtomicBool::new(false);
        let chunk = self.config.chunk_frames.max(1);
        let cancel: &AtomicBool = &self.cancel;

        std::thread::scope(|scope| -> Result<Vec<i16>, SessionError> {
            let (barrier, abort, clock, errors) = (&barrier, &abort, &clock, &errors);

            let producer = std::thread::Builder::new()
                .name("duplex-playback".into())
                .spawn_scoped(scope, move || {
                    barrier.wait();
                    let guard = TransferGuard {
                        cancel,
                        abort,
                        errors,
                        deadline: Instant::now() + budget,
                        budget,
                    };
                    let result = play(stimulus.samples(), playback, clock, &guard, chunk);
                    if result.is_err() {
                        abort.store(true, Ordering::Release);
                    }
                    result
                })
                .map_err(|e| {
                    SessionError::DeviceInit(format!("failed to spawn playback thread: {e}"))
                })?;

            barrier.wait();
            let guard = TransferGuard {
                cancel,
                abort,
                errors,
                deadline: Instant::now() + budget,
                budget,
            };
            let recorded = record(capture, clock, &guard, capture_len, chunk);
            if recorded.is_err() {
                abort.store(true, Ordering::Release);
            }

            let played = producer
                .join()
                .unwrap_or_else(|_| Err(SessionError::Stream("playback thread panicked".into())));

            match (recorded, played) {
                (Ok(samples), Ok(())) => Ok(samples),
                (Err(SessionError::PeerAborted), Err(e)) => Err(e),
                (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            }
        })
    }
}

/// Queue every stimulus sample in order, then wait until the device drained it
fn play(
    samples: &[i16],
    mut playback: ringbuf::HeapProd<i16>,
    clock: &FrameClock,
    guard: &TransferGuard<'_>,
    chunk: usize,
) -> Result<(), SessionError> {
    let mut queued = 0;
    while queued < samples.len() {
        guard.check()?;
        let end = (queued + chunk).min(samples.len());
        let pushed = playback.push_slice(&samples[queued..end]);
        queued += pushed;
        if pushed == 0 {
            guard.wait("playback")?;
        }
    }
    clock.mark_playback_queued();

    while playback.occupied_len() > 0 {
        guard.check()?;
        guard.wait("playback drain")?;
    }

    tracing::debug!(samples = samples.len(), "Stimulus fully rendered");
    Ok(())
}

/// Collect exactly `capture_len` samples aligned to the output timeline
fn record(
    mut capture: ringbuf::HeapCons<i16>,
    clock: &FrameClock,
    guard: &TransferGuard<'_>,
    capture_len: usize,
    chunk: usize,
) -> Result<Vec<i16>, SessionError> {
    let mut recorded: Vec<i16> = Vec::with_capacity(capture_len);
    let mut buffer = vec![0i16; chunk];
    let mut aligned = false;

    while recorded.len() < capture_len {
        guard.check()?;
        let overruns = clock.capture_overruns();
        if overruns > 0 {
            return Err(SessionError::Overrun(overruns));
        }

        if !aligned {
            if let Some(origin) = clock.input_origin() {
                let pad = usize::try_from(origin).unwrap_or(usize::MAX).min(capture_len);
                recorded.resize(pad, 0);
                aligned = true;
                if pad > 0 {
                    tracing::debug!(frames = pad, "Padded input warm-up with silence");
                }
                continue;
            }
        } else {
            let want = (capture_len - recorded.len()).min(chunk);
            let got = capture.pop_slice(&mut buffer[..want]);
            recorded.extend_from_slice(&buffer[..got]);
            if got > 0 {
                continue;
            }
        }

        guard.wait("capture")?;
    }

    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::loopback::LoopbackDevice;
    use crate::audio::signal::StimulusGenerator;

    fn sweep(sample_rate: u32, duration: f64) -> Waveform {
        StimulusGenerator::default()
            .generate(sample_rate, 100.0, 1000.0, duration)
            .unwrap()
    }

    #[test]
    fn test_identity_loopback_records_stimulus() {
        let stimulus = sweep(8000, 0.5);
        let mut session = DuplexSession::new(LoopbackDevice::new(8000));
        let capture = session.run(stimulus.clone(), 0.5).unwrap();
        assert_eq!(capture.recorded().samples(), stimulus.samples());
        assert_eq!(capture.stimulus(), &stimulus);
    }

    #[test]
    fn test_delay_shifts_recording() {
        let stimulus = sweep(8000, 0.5);
        let delay = 37;
        let mut session = DuplexSession::new(LoopbackDevice::new(8000).with_delay(delay));
        let (_, recorded) = session.run(stimulus.clone(), 0.5).unwrap().into_parts();

        assert!(recorded.samples()[..delay].iter().all(|&s| s == 0));
        assert_eq!(
            &recorded.samples()[delay..],
            &stimulus.samples()[..stimulus.len() - delay]
        );
    }

    #[test]
    fn test_warmup_is_padded_with_silence() {
        let stimulus = sweep(8000, 0.5);
        let warmup = 300;
        let mut session = DuplexSession::new(LoopbackDevice::new(8000).with_warmup(warmup));
        let recorded = session.run(stimulus.clone(), 0.5).unwrap().recorded().clone();

        assert_eq!(recorded.len(), stimulus.len());
        assert!(recorded.samples()[..warmup].iter().all(|&s| s == 0));
        // Timeline stays aligned with playback after the warm-up
        assert_eq!(&recorded.samples()[warmup..], &stimulus.samples()[warmup..]);
    }

    #[test]
    fn test_capture_longer_than_stimulus() {
        let stimulus = sweep(8000, 0.25);
        let mut session = DuplexSession::new(LoopbackDevice::new(8000));
        let recorded = session.run(stimulus.clone(), 1.0).unwrap().recorded().clone();
        assert_eq!(recorded.len(), 8000);
        assert_eq!(&recorded.samples()[..2000], stimulus.samples());
        assert!(recorded.samples()[2000..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_capture_shorter_than_stimulus() {
        let stimulus = sweep(8000, 1.0);
        let mut session = DuplexSession::new(LoopbackDevice::new(8000));
        let recorded = session.run(stimulus, 0.25).unwrap().recorded().clone();
        assert_eq!(recorded.len(), 2000);
    }

    #[test]
    fn test_device_init_failure() {
        let mut session = DuplexSession::new(LoopbackDevice::new(8000).failing_start());
        let err = session.run(sweep(8000, 0.25), 0.25).unwrap_err();
        assert!(matches!(err, SessionError::DeviceInit(_)));
        assert!(!session.device().is_running());
    }

    #[test]
    fn test_sample_rate_mismatch() {
        let mut session = DuplexSession::new(LoopbackDevice::new(16000));
        let err = session.run(sweep(8000, 0.25), 0.25).unwrap_err();
        assert_eq!(
            err,
            SessionError::SampleRateMismatch {
                expected: 16000,
                actual: 8000
            }
        );
    }

    #[test]
    fn test_invalid_capture_duration() {
        let mut session = DuplexSession::new(LoopbackDevice::new(8000));
        assert!(matches!(
            session.run(sweep(8000, 0.25), 0.0),
            Err(SessionError::InvalidParameter(_))
        ));
        assert!(matches!(
            session.run(sweep(8000, 0.25), f64::NAN),
            Err(SessionError::InvalidParameter(_))
        ));
        assert!(matches!(
            session.run(sweep(8000, 0.25), 1e20),
            Err(SessionError::InvalidParameter(_))
        ));
        assert_eq!(session.device().start_count(), 0);
    }

    #[test]
    fn test_unbounded_deadline_slack() {
        let config = SessionConfig {
            deadline_slack: Duration::MAX,
            ..Default::default()
        };
        let mut session = DuplexSession::with_config(LoopbackDevice::new(8000), config);
        assert!(matches!(
            session.run(sweep(8000, 0.25), 0.25),
            Err(SessionError::InvalidParameter(_))
        ));
        assert!(!session.device().is_running());
        assert_eq!(session.device().start_count(), 0);
    }

    #[test]
    fn test_cancelled_session() {
        let mut session = DuplexSession::new(LoopbackDevice::new(8000));
        session.cancel_handle().store(true, Ordering::Release);
        let err = session.run(sweep(8000, 0.25), 0.25).unwrap_err();
        assert_eq!(err, SessionError::Cancelled);
        assert!(!session.device().is_running());
    }

    #[test]
    fn test_stream_error_aborts() {
        let device = LoopbackDevice::new(8000).with_stream_error_after(1000);
        let mut session = DuplexSession::new(device);
        let err = session.run(sweep(8000, 1.0), 1.0).unwrap_err();
        assert!(matches!(err, SessionError::Stream(_)), "got {err:?}");
        assert!(!session.device().is_running());
    }

    #[test]
    fn test_session_is_reusable() {
        let mut session = DuplexSession::new(LoopbackDevice::new(8000).with_delay(5));
        for _ in 0..3 {
            let capture = session.run(sweep(8000, 0.25), 0.25).unwrap();
            assert_eq!(capture.recorded().len(), 2000);
        }
        assert_eq!(session.device().start_count(), 3);
    }
}

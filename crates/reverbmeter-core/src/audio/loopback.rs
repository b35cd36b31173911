//! Simulated speaker/microphone pair
//!
//! [`LoopbackDevice`] implements [`DuplexDevice`] without audio hardware. A
//! device thread pulls the playback ring one period at a time, runs it through
//! a sparse room response and pushes the result into the capture ring, keeping
//! the same frame accounting as a real duplex device.

use super::engine::{DuplexDevice, DuplexStreams, FrameClock};
use super::session::SessionError;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const IDLE_INTERVAL: Duration = Duration::from_micros(200);

/// How long a full capture ring may block the device before input is dropped
const CAPTURE_STALL_LIMIT: Duration = Duration::from_millis(100);

/// Room response norm used by [`exponential_response`]
const RESPONSE_NORM: f64 = 0.125;

/// Peak of the reverberant tail relative to the direct sound
const TAIL_GAIN: f64 = 0.3;

/// Deterministic pseudo-random source in [-1, 1]
struct Lcg(u32);

impl Lcg {
    fn next(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        ((self.0 >> 16) & 0x7fff) as f64 / 16383.5 - 1.0
    }
}

/// Synthetic room response: direct sound after `delay` samples followed by a
/// noise tail whose energy falls 60 dB over `t60` seconds
pub fn exponential_response(sample_rate: u32, t60: f64, delay: usize) -> Vec<f64> {
    let tail = (t60.max(0.0) * sample_rate as f64) as usize;
    let decay = 1000f64.ln() / (t60 * sample_rate as f64).max(1.0);
    let mut rng = Lcg(0x5eed_1234);

    let mut response = vec![0.0; delay + tail + 1];
    response[delay] = 1.0;
    for n in 1..=tail {
        response[delay + n] = TAIL_GAIN * rng.next() * (-decay * n as f64).exp();
    }

    let norm = response.iter().map(|h| h * h).sum::<f64>().sqrt();
    for h in &mut response {
        *h *= RESPONSE_NORM / norm;
    }
    response
}

/// Sparse FIR over a circular history of rendered samples
struct Room {
    taps: Vec<(usize, f64)>,
    history: Vec<f64>,
    pos: usize,
    noise_amplitude: f64,
    rng: Lcg,
}

impl Room {
    fn new(taps: &[(usize, f64)], noise_amplitude: f64) -> Self {
        let len = taps.iter().map(|&(d, _)| d).max().unwrap_or(0) + 1;
        Self {
            taps: taps.to_vec(),
            history: vec![0.0; len],
            pos: 0,
            noise_amplitude,
            rng: Lcg(0x0bad_cafe),
        }
    }

    fn process(&mut self, x: i16) -> i16 {
        let len = self.history.len();
        self.pos = (self.pos + 1) % len;
        self.history[self.pos] = x as f64;

        let pos = self.pos;
        let mut y: f64 = self
            .taps
            .iter()
            .map(|&(delay, gain)| {
                let idx = if pos >= delay {
                    pos - delay
                } else {
                    pos + len - delay
                };
                gain * self.history[idx]
            })
            .sum();
        if self.noise_amplitude > 0.0 {
            y += self.noise_amplitude * self.rng.next();
        }
        y.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

/// In-process duplex device simulating a room
///
/// # Example
/// ```
/// use reverbmeter_core::audio::loopback::LoopbackDevice;
///
/// // Direct sound after 2 ms at 16 kHz
/// let device = LoopbackDevice::new(16000).with_delay(32);
/// assert!(!device.is_running());
/// ```
pub struct LoopbackDevice {
    sample_rate: u32,
    period_frames: usize,
    taps: Vec<(usize, f64)>,
    noise_amplitude: f64,
    warmup_frames: usize,
    fail_start: bool,
    error_after: Option<u64>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    starts: usize,
}

impl LoopbackDevice {
    /// Ideal wire: the microphone hears exactly what is played
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            period_frames: 256,
            taps: vec![(0, 1.0)],
            noise_amplitude: 0.0,
            warmup_frames: 0,
            fail_start: false,
            error_after: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            starts: 0,
        }
    }

    /// Unit-gain direct sound after `frames` samples
    pub fn with_delay(mut self, frames: usize) -> Self {
        self.taps = vec![(frames, 1.0)];
        self
    }

    /// Arbitrary room impulse response; zero taps are skipped
    pub fn with_response(mut self, response: &[f64]) -> Self {
        self.taps = response
            .iter()
            .enumerate()
            .filter(|(_, &h)| h != 0.0)
            .map(|(d, &h)| (d, h))
            .collect();
        self
    }

    /// Room from [`exponential_response`]
    pub fn with_exponential_decay(self, t60: f64, delay: usize) -> Self {
        let response = exponential_response(self.sample_rate, t60, delay);
        self.with_response(&response)
    }

    /// Nothing reaches the microphone
    pub fn muted(mut self) -> Self {
        self.taps.clear();
        self
    }

    /// Add uniform background noise of the given peak amplitude
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude.max(0.0);
        self
    }

    /// Drop the first `frames` captured frames, like a converter that needs
    /// time to lock
    pub fn with_warmup(mut self, frames: usize) -> Self {
        self.warmup_frames = frames;
        self
    }

    pub fn with_period(mut self, frames: usize) -> Self {
        self.period_frames = frames.max(1);
        self
    }

    /// Report a stream error once `frames` output frames were rendered
    pub fn with_stream_error_after(mut self, frames: u64) -> Self {
        self.error_after = Some(frames);
        self
    }

    /// Every `start` fails with [`SessionError::DeviceInit`]
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Number of successful starts
    pub fn start_count(&self) -> usize {
        self.starts
    }
}

impl DuplexDevice for LoopbackDevice {
    fn name(&self) -> String {
        "loopback".to_string()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, ring_capacity: usize) -> Result<DuplexStreams, SessionError> {
        self.stop();
        if self.fail_start {
            return Err(SessionError::DeviceInit(
                "simulated device refused to open".into(),
            ));
        }

        let (playback_prod, mut playback_cons) = HeapRb::<i16>::new(ring_capacity).split();
        let (mut capture_prod, capture_cons) = HeapRb::<i16>::new(ring_capacity).split();
        let (err_tx, err_rx) = crossbeam_channel::bounded::<String>(16);
        let clock = FrameClock::new();

        let mut room = Room::new(&self.taps, self.noise_amplitude);
        let period = self.period_frames;
        let mut warmup = self.warmup_frames;
        let error_after = self.error_after;
        let device_clock = Arc::clone(&clock);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let worker = std::thread::Builder::new()
            .name("loopback-device".into())
            .spawn(move || {
                let clock = device_clock;
                let mut rendered = vec![0i16; period];
                let mut heard = Vec::with_capacity(period);
                let mut input_started = false;
                let mut overflowing = false;
                let mut error_sent = false;

                while running.load(Ordering::Acquire) {
                    if playback_cons.occupied_len() < period && !clock.playback_queued() {
                        std::thread::sleep(IDLE_INTERVAL);
                        continue;
                    }

                    let got = playback_cons.pop_slice(&mut rendered);
                    rendered[got..].fill(0);

                    heard.clear();
                    let mut first_heard = None;
                    for (i, &x) in rendered.iter().enumerate() {
                        let y = room.process(x);
                        if warmup > 0 {
                            warmup -= 1;
                            continue;
                        }
                        first_heard.get_or_insert(i);
                        heard.push(y);
                    }

                    match first_heard {
                        Some(offset) if !input_started => {
                            clock.advance_output(offset as u64);
                            clock.mark_input_start();
                            clock.advance_output((period - offset) as u64);
                            input_started = true;
                        }
                        _ => clock.advance_output(period as u64),
                    }

                    if !heard.is_empty() {
                        let stall_started = Instant::now();
                        while !overflowing
                            && capture_prod.vacant_len() < heard.len()
                            && running.load(Ordering::Acquire)
                        {
                            if stall_started.elapsed() > CAPTURE_STALL_LIMIT {
                                overflowing = true;
                                break;
                            }
                            std::thread::sleep(IDLE_INTERVAL);
                        }
                        let pushed = capture_prod.push_slice(&heard);
                        if pushed < heard.len() {
                            clock.record_overrun((heard.len() - pushed) as u64);
                        }
                        clock.advance_input(heard.len() as u64);
                    }

                    if let Some(limit) = error_after {
                        if !error_sent && clock.output_frames() >= limit {
                            let _ = err_tx.try_send("loopback: simulated stream fault".into());
                            error_sent = true;
                        }
                    }
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                SessionError::DeviceInit(format!("failed to spawn device thread: {e}"))
            })?;

        self.worker = Some(worker);
        self.starts += 1;
        tracing::debug!(
            sample_rate = self.sample_rate,
            taps = self.taps.len(),
            warmup = self.warmup_frames,
            "Loopback device started"
        );

        Ok(DuplexStreams {
            playback: playback_prod,
            capture: capture_cons,
            clock,
            errors: err_rx,
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Loopback device thread panicked");
            }
            tracing::debug!("Loopback device stopped");
        }
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_response_shape() {
        let response = exponential_response(8000, 0.5, 20);
        assert_eq!(response.len(), 20 + 4000 + 1);
        assert!(response[..20].iter().all(|&h| h == 0.0));

        let norm = response.iter().map(|h| h * h).sum::<f64>().sqrt();
        assert!((norm - RESPONSE_NORM).abs() < 1e-12);

        // Energy in the last tenth is far below the first tenth
        let energy = |r: &[f64]| r.iter().map(|h| h * h).sum::<f64>();
        let early = energy(&response[21..421]);
        let late = energy(&response[3621..]);
        assert!(late < early * 1e-4);
    }

    #[test]
    fn test_room_applies_taps() {
        let mut room = Room::new(&[(0, 0.5), (2, 0.25)], 0.0);
        let out: Vec<i16> = [100, 0, 0, 0].iter().map(|&x| room.process(x)).collect();
        assert_eq!(out, vec![50, 0, 25, 0]);
    }

    #[test]
    fn test_room_saturates() {
        let mut room = Room::new(&[(0, 4.0)], 0.0);
        assert_eq!(room.process(20000), i16::MAX);
        assert_eq!(room.process(-20000), i16::MIN);
    }

    #[test]
    fn test_start_stop_is_idempotent() {
        let mut device = LoopbackDevice::new(8000);
        device.stop();
        let streams = device.start(1024).unwrap();
        assert!(device.is_running());
        drop(streams);
        device.stop();
        device.stop();
        assert!(!device.is_running());
        assert_eq!(device.start_count(), 1);
    }

    #[test]
    fn test_failing_start_leaves_device_stopped() {
        let mut device = LoopbackDevice::new(8000).failing_start();
        assert!(matches!(device.start(1024), Err(SessionError::DeviceInit(_))));
        assert!(!device.is_running());
        assert_eq!(device.start_count(), 0);
    }
}

//! Duplex audio device management
//!
//! Provides the transducer seam used by [`crate::audio::session::DuplexSession`]:
//! - [`DuplexDevice`] trait: start capture + playback, hand out ring buffer ends
//! - [`FrameClock`]: frame counters shared between callbacks and the session
//! - [`CpalDevice`]: real speaker/microphone pair via cpal
//!
//! ## Timing
//!
//! Both callbacks count frames on the device clock. The input callback records
//! how many output frames had already been rendered when the first input frame
//! arrived; the session pads the recording with that many zeros so the
//! recording timeline starts no later than playback.

use super::session::SessionError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Capacity of the device error channel
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Sentinel for "no input frame seen yet"
const NO_ORIGIN: u64 = u64::MAX;

/// Frame counters shared between device callbacks and the session threads
#[derive(Debug)]
pub struct FrameClock {
    /// Frames rendered by the output callback (including underrun silence)
    output_frames: AtomicU64,
    /// Frames delivered by the input callback
    input_frames: AtomicU64,
    /// Output frame count at the moment the first input frame arrived
    input_origin: AtomicU64,
    /// Input frames that could not be queued (capture ring full)
    capture_overruns: AtomicU64,
    /// Producer has queued every stimulus sample
    playback_queued: AtomicBool,
}

impl FrameClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            output_frames: AtomicU64::new(0),
            input_frames: AtomicU64::new(0),
            input_origin: AtomicU64::new(NO_ORIGIN),
            capture_overruns: AtomicU64::new(0),
            playback_queued: AtomicBool::new(false),
        })
    }

    /// Called by the output side after rendering `frames`
    pub fn advance_output(&self, frames: u64) {
        self.output_frames.fetch_add(frames, Ordering::Release);
    }

    /// Called by the input side before queuing its first frames.
    /// Only the first call has an effect.
    pub fn mark_input_start(&self) {
        let origin = self.output_frames.load(Ordering::Acquire);
        let _ = self.input_origin.compare_exchange(
            NO_ORIGIN,
            origin,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Called by the input side after queuing `frames`
    pub fn advance_input(&self, frames: u64) {
        self.input_frames.fetch_add(frames, Ordering::Release);
    }

    pub fn record_overrun(&self, frames: u64) {
        self.capture_overruns.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn mark_playback_queued(&self) {
        self.playback_queued.store(true, Ordering::Release);
    }

    pub fn output_frames(&self) -> u64 {
        self.output_frames.load(Ordering::Acquire)
    }

    pub fn input_frames(&self) -> u64 {
        self.input_frames.load(Ordering::Acquire)
    }

    /// Output frame count at the first captured frame, once known
    pub fn input_origin(&self) -> Option<u64> {
        match self.input_origin.load(Ordering::Acquire) {
            NO_ORIGIN => None,
            origin => Some(origin),
        }
    }

    pub fn capture_overruns(&self) -> u64 {
        self.capture_overruns.load(Ordering::Relaxed)
    }

    pub fn playback_queued(&self) -> bool {
        self.playback_queued.load(Ordering::Acquire)
    }
}

/// Session-side ends of a running duplex device
pub struct DuplexStreams {
    /// Stimulus samples pushed here are rendered in order
    pub playback: ringbuf::HeapProd<i16>,
    /// Captured samples arrive here in order
    pub capture: ringbuf::HeapCons<i16>,
    /// Shared frame counters
    pub clock: Arc<FrameClock>,
    /// Runtime errors reported by the device
    pub errors: crossbeam_channel::Receiver<String>,
}

/// A speaker/microphone pair that can run one duplex transfer at a time
pub trait DuplexDevice {
    /// Human-readable device name for logs
    fn name(&self) -> String;

    /// Sample rate the device runs at
    fn sample_rate(&self) -> u32;

    /// Open and start both directions, capture first.
    ///
    /// # Errors
    /// [`SessionError::DeviceInit`] if either transducer fails to start. No
    /// handle stays open in that case.
    fn start(&mut self, ring_capacity: usize) -> Result<DuplexStreams, SessionError>;

    /// Stop both directions and release device handles. Idempotent.
    fn stop(&mut self);
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default input or output device
    pub is_default: bool,
    /// Supported sample rates among common rates
    pub sample_rates: Vec<u32>,
    /// Number of input channels
    pub input_channels: u16,
    /// Number of output channels
    pub output_channels: u16,
}

/// Speaker/microphone pair on the default cpal host
pub struct CpalDevice {
    input: Device,
    output: Device,
    input_name: String,
    output_name: String,
    sample_rate: u32,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
}

impl CpalDevice {
    /// List devices on the default host
    ///
    /// # Returns
    /// Vector of device information for all available devices
    pub fn list_devices() -> Result<Vec<DeviceInfo>, SessionError> {
        let host = cpal::default_host();
        let mut devices = Vec::new();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let all = host
            .devices()
            .map_err(init_error)?;

        for device in all {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let is_default = default_input.as_deref() == Some(name.as_str())
                || default_output.as_deref() == Some(name.as_str());

            let input_channels = device
                .default_input_config()
                .map(|c| c.channels())
                .unwrap_or(0);
            let output_channels = device
                .default_output_config()
                .map(|c| c.channels())
                .unwrap_or(0);

            let common_rates = [16000, 22050, 32000, 44100, 48000, 96000];
            let mut sample_rates = Vec::new();
            let ranges = device
                .supported_output_configs()
                .map(|c| c.collect::<Vec<_>>())
                .or_else(|_| device.supported_input_configs().map(|c| c.collect()))
                .unwrap_or_default();
            for config in ranges {
                for &rate in &common_rates {
                    if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
            }
            sample_rates.sort();

            devices.push(DeviceInfo {
                name,
                is_default,
                sample_rates,
                input_channels,
                output_channels,
            });
        }

        Ok(devices)
    }

    /// Select input and output devices by name, or the host defaults
    pub fn open(
        input_name: Option<&str>,
        output_name: Option<&str>,
        sample_rate: u32,
    ) -> Result<Self, SessionError> {
        let host = cpal::default_host();

        let input = match input_name {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_input_device()
                .ok_or_else(|| SessionError::DeviceInit("no default input device".into()))?,
        };
        let output = match output_name {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_output_device()
                .ok_or_else(|| SessionError::DeviceInit("no default output device".into()))?,
        };

        let input_name = input.name().unwrap_or_else(|_| "unknown input".into());
        let output_name = output.name().unwrap_or_else(|_| "unknown output".into());

        tracing::info!(
            input = %input_name,
            output = %output_name,
            sample_rate,
            "Selected audio devices"
        );

        Ok(Self {
            input,
            output,
            input_name,
            output_name,
            sample_rate,
            input_stream: None,
            output_stream: None,
        })
    }

    fn build_streams(&mut self, ring_capacity: usize) -> Result<DuplexStreams, SessionError> {
        let output_channels = self
            .output
            .default_output_config()
            .map(|c| c.channels())
            .map_err(init_error)?;
        let input_channels = self
            .input
            .default_input_config()
            .map(|c| c.channels())
            .map_err(init_error)?;

        let output_config = StreamConfig {
            channels: output_channels,
            sample_rate: SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let input_config = StreamConfig {
            channels: input_channels,
            sample_rate: SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (playback_prod, mut playback_cons) = HeapRb::<i16>::new(ring_capacity).split();
        let (mut capture_prod, capture_cons) = HeapRb::<i16>::new(ring_capacity).split();
        let (err_tx, err_rx) = crossbeam_channel::bounded::<String>(ERROR_CHANNEL_CAPACITY);
        let clock = FrameClock::new();

        // Output: mono stimulus copied to every channel, silence on underrun
        let output_clock = Arc::clone(&clock);
        let output_err = err_tx.clone();
        let num_output_channels = output_channels as usize;
        let output_stream = self
            .output
            .build_output_stream(
                &output_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut frames = 0u64;
                    for frame in data.chunks_mut(num_output_channels) {
                        let sample = playback_cons
                            .try_pop()
                            .map(|s| s as f32 / 32768.0)
                            .unwrap_or(0.0);
                        frame.fill(sample);
                        frames += 1;
                    }
                    output_clock.advance_output(frames);
                },
                move |err| {
                    tracing::error!("Output stream error: {}", err);
                    let _ = output_err.try_send(format!("output: {err}"));
                },
                None,
            )
            .map_err(init_error)?;

        // Input: channel 0 only
        let input_clock = Arc::clone(&clock);
        let input_err = err_tx;
        let num_input_channels = input_channels as usize;
        let input_stream = self
            .input
            .build_input_stream(
                &input_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    input_clock.mark_input_start();
                    let mut frames = 0u64;
                    let mut dropped = 0u64;
                    for frame in data.chunks(num_input_channels) {
                        let sample = frame
                            .first()
                            .map(|&x| (x * 32768.0).round().clamp(-32768.0, 32767.0) as i16)
                            .unwrap_or(0);
                        if capture_prod.try_push(sample).is_err() {
                            dropped += 1;
                        }
                        frames += 1;
                    }
                    if dropped > 0 {
                        input_clock.record_overrun(dropped);
                    }
                    input_clock.advance_input(frames);
                },
                move |err| {
                    tracing::error!("Input stream error: {}", err);
                    let _ = input_err.try_send(format!("input: {err}"));
                },
                None,
            )
            .map_err(init_error)?;

        // Capture must not start later than playback
        input_stream.play().map_err(init_error)?;
        output_stream.play().map_err(init_error)?;

        tracing::info!(
            input = %self.input_name,
            output = %self.output_name,
            input_channels,
            output_channels,
            sample_rate = self.sample_rate,
            "Duplex streams started"
        );

        self.input_stream = Some(input_stream);
        self.output_stream = Some(output_stream);

        Ok(DuplexStreams {
            playback: playback_prod,
            capture: capture_cons,
            clock,
            errors: err_rx,
        })
    }
}

impl DuplexDevice for CpalDevice {
    fn name(&self) -> String {
        format!("{} -> {}", self.output_name, self.input_name)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, ring_capacity: usize) -> Result<DuplexStreams, SessionError> {
        // Streams built before a failure are dropped with the error
        self.build_streams(ring_capacity).inspect_err(|e| {
            tracing::error!(error = %e, "Failed to start duplex streams");
            self.stop();
        })
    }

    fn stop(&mut self) {
        let was_running = self.input_stream.is_some() || self.output_stream.is_some();
        self.output_stream = None;
        self.input_stream = None;
        if was_running {
            tracing::info!("Duplex streams stopped");
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn init_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::DeviceInit(e.to_string())
}

fn find_device(host: &cpal::Host, name: &str) -> Result<Device, SessionError> {
    host.devices()
        .map_err(init_error)?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| SessionError::DeviceNotFound(name.to_string()))
}

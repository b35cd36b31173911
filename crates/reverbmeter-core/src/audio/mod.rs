//! Audio acquisition module
//!
//! This module contains everything that touches samples before analysis:
//! - Sine sweep stimulus generation ([`signal`])
//! - Playback level self-calibration ([`calibration`])
//! - Duplex device seam and cpal backend ([`engine`])
//! - Simulated room device for tests and dry runs ([`loopback`])
//! - Time-synchronized playback + capture ([`session`])

pub mod calibration;
pub mod engine;
pub mod loopback;
pub mod session;
pub mod signal;

//! Offline analysis of completed captures
//!
//! - Impulse response extraction ([`rir`])
//! - Energy decay curve and T60 estimation ([`decay`])

pub mod decay;
pub mod rir;

#![cfg_attr(not(test), no_std)]
//! Real-time trigger, timing and buffer-indexing core of a multi-instrument data-acquisition
//! device.
//!
//! * [buffer_index] computes sample-rate timer settings and where the trigger and the point of
//!   interest land in the capture buffer.
//! * [timeout] multiplexes one hardware countdown timer over the "stop capture" deadlines of
//!   several instruments.
//! * [trigger] locates the trigger crossing inside the circular DMA buffers and schedules the
//!   staggered channel shutdown.
//! * [state] is the cooperative step-function protocol every instrument operation follows.
//!
//! All hardware access goes through the traits in [hardware].

pub mod buffer_index;
pub mod hardware;
pub mod instrument;
pub mod settings;
pub mod state;
pub mod timeout;
pub mod trigger;

pub use exact_math;

//! Queue protocol for platform listeners
//!
//! This module defines the job, report and subsystem records exchanged over
//! the queue, and the naming rules for the per-platform channels.

pub mod channels;
pub mod messages;

pub use channels::*;
pub use messages::*;

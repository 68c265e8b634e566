// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Facility-based logging for the relay daemon.
//!
//! Every component logs through a cloneable [`Logger`] handle carrying a
//! [`Facility`] tag and an RFC 5424 [`Severity`]. Messages above the
//! configured maximum severity are discarded before formatting.

mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;

pub use facility::Facility;
pub use logger::{DiscardSink, LogSink, Logger, StderrSink};
pub use severity::Severity;

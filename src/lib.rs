//! Laser-triggered light meter calibration collector.
//!
//! This crate automates collection of calibration samples from a light meter
//! on a local serial tty while a remote host fires a laser over SSH at a
//! configurable duty cycle. Each (duty, replicate) pair is one sample: one
//! remote trigger, one serial capture, one JSON file outcome.
//!
//! # Timing
//!
//! The trigger and the capture overlap in time by design. The remote command
//! is fire-and-forget on its own thread; the serial stream is the only
//! signal the capture loop ever sees. A per-sample read deadline bounds a
//! silent or failed firing, and a pacing delay between samples lets the
//! laser and sensor settle.

pub mod collect;
pub mod errors;
pub mod logging;
pub mod plan;
pub mod remote;
pub mod terminal;

pub use collect::{Collector, SampleOutcome, DEFAULT_END_PATTERN, DEFAULT_PACING};
pub use errors::{CollectorError, Result};
pub use plan::{RunManifest, Sample};
pub use remote::{CommandTask, RemoteSession, TriggerCommand};
pub use terminal::{LineSource, PrivilegedConfigurator, ReadTerminal, SudoStty};

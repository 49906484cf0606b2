//! Acceptance scenarios for the nanotime engine.
//!
//! Most tests run on simulated counters and finish in milliseconds. The
//! soak test uses the host monotonic clock and runs for several seconds.

mod calibration_test;
mod common;
mod deadline_test;
mod monotonic_test;
mod sleep_wake_test;

#![doc = "Multiprocessor nanotime engine: per-CPU cycle-counter time bases, calibration, rebasing and one-shot deadline timers."]

pub mod calibrate;
pub mod clock;
pub mod deadline;
pub mod fixed_point;
pub mod hal;
pub mod host;
pub mod percpu;
pub mod publish;
pub mod rebase;
pub mod seqlock;
pub mod sim;
pub mod timebase;

pub use calibrate::*;
pub use clock::*;
pub use deadline::*;
pub use fixed_point::*;
pub use hal::*;
pub use host::{host_nanos, pin_current_thread, HostCounter};
pub use percpu::PerCpu;
pub use publish::*;
pub use rebase::*;
pub use seqlock::*;
pub use timebase::*;

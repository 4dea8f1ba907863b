// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/util/mod.rs

pub mod clock;
pub mod dispatch_queue;
pub mod stats;
pub mod timer;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::dispatch_queue::DispatchQueue;
pub use self::stats::StatsCounters;
pub use self::timer::PeriodicTimer;

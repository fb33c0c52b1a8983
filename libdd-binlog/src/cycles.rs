// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cycle-counter time source. Record timestamps are raw counter samples;
//! the checkpoint written at the head of each log file carries one
//! (counter, wall clock, counter rate) correspondence so the decoder can
//! turn them back into wall-clock times.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Samples the monotonic cycle counter. On x86-64 this is a single rdtsc;
/// elsewhere it falls back to monotonic nanoseconds, which
/// [`cycles_per_second`] reports accordingly.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: RDTSC has no preconditions.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Counter ticks per second, calibrated once against the monotonic clock.
pub fn cycles_per_second() -> f64 {
    static RATE: OnceLock<f64> = OnceLock::new();
    *RATE.get_or_init(calibrate)
}

#[cfg(target_arch = "x86_64")]
fn calibrate() -> f64 {
    let wall_start = Instant::now();
    let cycles_start = rdtsc();
    while wall_start.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let cycles = rdtsc().wrapping_sub(cycles_start);
    cycles as f64 / wall_start.elapsed().as_secs_f64()
}

#[cfg(not(target_arch = "x86_64"))]
fn calibrate() -> f64 {
    1.0e9
}

/// Converts a tick count to seconds.
pub fn to_seconds(cycles: u64) -> f64 {
    cycles as f64 / cycles_per_second()
}

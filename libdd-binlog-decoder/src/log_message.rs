// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The decoded-record carrier handed back by the iterative decoder
//! interface. Dynamic arguments live in 8-byte slots, ten of them inline
//! with doubling growth beyond that; callers must know the argument types
//! to get them back out. `long double` stays unsupported: the slots are 8
//! bytes wide and widening them would hide the precision loss.

use crate::format::FormatMetadata;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::error;

/// Slot stored when a `long double` argument is pushed, mirroring the
/// refusal value readers get back.
const LONG_DOUBLE_SENTINEL: u64 = -1i64 as u64;

/// Primitive types that fit a slot. Conversion is bit-reinterpretation
/// widened to 64 bits, so a value pushed as one type reads back sensibly
/// only as that type.
pub trait SlotValue: Copy {
    fn to_slot(self) -> u64;
    fn from_slot(raw: u64) -> Self;
}

macro_rules! int_slot {
    ($($ty:ty),*) => {$(
        impl SlotValue for $ty {
            fn to_slot(self) -> u64 {
                self as u64
            }
            fn from_slot(raw: u64) -> $ty {
                raw as $ty
            }
        }
    )*};
}
int_slot!(u8, u16, u32, u64, i8, i16, i32, i64);

impl SlotValue for f64 {
    fn to_slot(self) -> u64 {
        self.to_bits()
    }
    fn from_slot(raw: u64) -> f64 {
        f64::from_bits(raw)
    }
}

impl SlotValue for f32 {
    fn to_slot(self) -> u64 {
        self.to_bits() as u64
    }
    fn from_slot(raw: u64) -> f32 {
        f32::from_bits(raw as u32)
    }
}

/// One decoded log statement: its static metadata, id, raw timestamp, and
/// the dynamic arguments in format-string order. String arguments are
/// owned by the carrier and stay valid until the next [`LogMessage::reset`].
pub struct LogMessage {
    metadata: Option<Arc<FormatMetadata>>,
    log_id: u32,
    timestamp: u64,
    slots: SmallVec<[u64; 10]>,
    strings: Vec<String>,
}

impl Default for LogMessage {
    fn default() -> Self {
        LogMessage::new()
    }
}

impl LogMessage {
    pub fn new() -> LogMessage {
        LogMessage {
            metadata: None,
            log_id: u32::MAX,
            timestamp: 0,
            slots: SmallVec::new(),
            strings: Vec::new(),
        }
    }

    /// Whether the carrier holds a decoded statement.
    pub fn valid(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn num_args(&self) -> usize {
        self.slots.len()
    }

    pub fn log_id(&self) -> u32 {
        self.log_id
    }

    /// Raw cycle-counter timestamp of the log invocation.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn metadata(&self) -> Option<&Arc<FormatMetadata>> {
        self.metadata.as_ref()
    }

    /// Readies the carrier for the next statement, invalidating previous
    /// argument values and strings.
    pub fn reset(&mut self, metadata: Option<Arc<FormatMetadata>>, log_id: u32, timestamp: u64) {
        self.metadata = metadata;
        self.log_id = log_id;
        self.timestamp = timestamp;
        self.slots.clear();
        self.strings.clear();
    }

    pub fn push<T: SlotValue>(&mut self, value: T) {
        self.slots.push(value.to_slot());
    }

    /// The n-th argument (0-based) re-interpreted as `T`. No type checking
    /// happens; the caller must know the argument types.
    pub fn get<T: SlotValue>(&self, index: usize) -> Option<T> {
        self.slots.get(index).map(|raw| T::from_slot(*raw))
    }

    /// Stores a string argument; its slot holds the string's index.
    pub fn push_str(&mut self, value: &str) {
        self.slots.push(self.strings.len() as u64);
        self.strings.push(value.to_owned());
    }

    pub fn get_str(&self, index: usize) -> Option<&str> {
        let slot = *self.slots.get(index)? as usize;
        self.strings.get(slot).map(String::as_str)
    }

    /// `long double` arguments are not representable in a slot; a sentinel
    /// is stored instead.
    pub fn push_long_double(&mut self) {
        self.slots.push(LONG_DOUBLE_SENTINEL);
    }

    /// Reading a `long double` slot is an error; returns -1.
    pub fn get_long_double(&self, _index: usize) -> f64 {
        error!("aggregating on long doubles is unsupported");
        -1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::create_micro_code;

    #[test]
    fn starts_invalid() {
        let msg = LogMessage::new();
        assert!(!msg.valid());
        assert_eq!(0, msg.num_args());
        assert_eq!(u32::MAX, msg.log_id());
    }

    #[test]
    fn push_and_get_primitives() {
        let mut msg = LogMessage::new();
        msg.push(42i32);
        msg.push(-1i64);
        msg.push(0.5f64);
        msg.push(7u8);
        assert_eq!(Some(42i32), msg.get(0));
        assert_eq!(Some(-1i64), msg.get(1));
        assert_eq!(Some(0.5f64), msg.get(2));
        assert_eq!(Some(7u8), msg.get(3));
        assert_eq!(None, msg.get::<u64>(4));
    }

    #[test]
    fn grows_past_the_inline_slots() {
        let mut msg = LogMessage::new();
        for i in 0..25i64 {
            msg.push(i);
        }
        assert_eq!(25, msg.num_args());
        for i in 0..25i64 {
            assert_eq!(Some(i), msg.get(i as usize));
        }
    }

    #[test]
    fn strings_are_owned_until_reset() {
        let mut msg = LogMessage::new();
        msg.push(1i32);
        msg.push_str("hello");
        assert_eq!(Some("hello"), msg.get_str(1));
        assert_eq!(None, msg.get_str(0));

        msg.reset(None, 0, 0);
        assert_eq!(None, msg.get_str(1));
        assert_eq!(0, msg.num_args());
    }

    #[test]
    fn long_double_is_refused() {
        let mut msg = LogMessage::new();
        msg.push_long_double();
        assert_eq!(-1.0, msg.get_long_double(0));
        // The sentinel reads back as -1 for integer probes too.
        assert_eq!(Some(-1i64), msg.get(0));
    }

    #[test]
    fn reset_installs_metadata() {
        let meta = Arc::new(create_micro_code("%d", "a.cc", 3, 1).unwrap());
        let mut msg = LogMessage::new();
        msg.reset(Some(meta.clone()), 9, 1234);
        assert!(msg.valid());
        assert_eq!(9, msg.log_id());
        assert_eq!(1234, msg.timestamp());
        assert_eq!("%d", msg.metadata().unwrap().format);
    }
}

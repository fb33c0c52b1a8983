// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output buffers for the compression thread. Direct I/O requires the
//! source buffer (and the write length) to be 512-byte aligned, which a
//! `Vec` cannot promise, so these are allocated by hand.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment of the output buffers and the write-length granularity under
/// `O_DIRECT`.
pub const BUFFER_ALIGNMENT: usize = 512;

/// A fixed-size, zero-initialized, 512-byte-aligned byte buffer.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer is an owned allocation; nothing aliases it.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> anyhow::Result<AlignedBuf> {
        let layout = Layout::from_size_align(len, BUFFER_ALIGNMENT)?;
        anyhow::ensure!(len > 0, "aligned buffer must not be empty");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            anyhow::bail!("could not allocate a {len}-byte output buffer");
        };
        Ok(AlignedBuf { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is live and exclusively owned.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is live and exclusively owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // The layout cannot fail: it succeeded at allocation time.
        if let Ok(layout) = Layout::from_size_align(self.len, BUFFER_ALIGNMENT) {
            // SAFETY: allocated with the identical layout in `zeroed`.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_and_zeroing() {
        let mut buf = AlignedBuf::zeroed(4096).unwrap();
        assert_eq!(0, buf.as_slice().as_ptr() as usize % BUFFER_ALIGNMENT);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice()[7] = 0xAB;
        assert_eq!(0xAB, buf.as_slice()[7]);
        assert_eq!(4096, buf.len());
    }

    #[test]
    fn zero_length_rejected() {
        assert!(AlignedBuf::zeroed(0).is_err());
    }
}

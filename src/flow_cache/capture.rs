/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cmp;
use std::fmt;

// Segment bookkeeping stops after this many packets. The bytes themselves
// keep landing in the buffer, only the per-packet boundaries are lost.
const SEGMENT_INDEX_MAX: usize = 32;

/// One packet's contribution to the capture buffer, after truncation to the
/// buffer capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSegment {
    pub offset: u32,
    pub len: u32,
}

/// Fixed-capacity payload capture for one flow direction.
///
/// TCP payload is written at `seq - isn` so retransmitted and reordered
/// segments land at their stream offset; untouched gaps read as zero. Other
/// protocols simply append. Capacity never changes after construction, and
/// anything past it is silently discarded.
#[derive(Clone)]
pub struct CaptureBuffer {
    data: Vec<u8>,
    filled: u32,
    segments: Vec<PayloadSegment>,
}

impl CaptureBuffer {
    pub fn new(cap: u32) -> Self {
        Self {
            data: vec![0u8; cap as usize],
            filled: 0,
            segments: Vec::new(),
        }
    }

    pub fn cap(&self) -> u32 {
        self.data.len() as u32
    }

    /// High-water mark: offset one past the last byte ever written.
    pub fn filled(&self) -> u32 {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Captured bytes up to the high-water mark. Stream gaps are zero.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.filled as usize]
    }

    pub fn segments(&self) -> &[PayloadSegment] {
        &self.segments
    }

    /// Writes `payload` at a fixed stream offset, truncating to capacity.
    /// Returns the number of bytes actually stored.
    pub fn write_at(&mut self, offset: u32, payload: &[u8]) -> u32 {
        let cap = self.cap();
        if payload.is_empty() || offset >= cap {
            return 0;
        }
        let n = cmp::min(payload.len() as u32, cap - offset);
        let start = offset as usize;
        self.data[start..start + n as usize].copy_from_slice(&payload[..n as usize]);
        self.filled = cmp::max(self.filled, offset + n);
        if self.segments.len() < SEGMENT_INDEX_MAX {
            self.segments.push(PayloadSegment { offset, len: n });
        }
        n
    }

    /// Appends at the current high-water mark.
    pub fn append(&mut self, payload: &[u8]) -> u32 {
        self.write_at(self.filled, payload)
    }
}

impl fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("cap", &self.cap())
            .field("filled", &self.filled)
            .field("segments", &self.segments.len())
            .finish()
    }
}

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

use std::fmt;

use super::enums::TcpFlags;
use super::lookup_key::LookupKey;

pub const MPLS_STACK_DEPTH: usize = 3;
const MPLS_LABEL_MASK: u32 = 0x000f_ffff;

/// Transport header subset the cache consumes. The decoder fills it for TCP
/// packets only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub mptcp_token: Option<u32>,
}

/// Order-sensitive key of the top labels of an MPLS stack. The decoder
/// passes extracted 20-bit label values outermost first; entries beyond
/// [`MPLS_STACK_DEPTH`] are ignored, missing ones stay zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelStack {
    pub labels: [u32; MPLS_STACK_DEPTH],
}

impl LabelStack {
    pub fn new(labels: &[u32]) -> Self {
        let mut stack = Self::default();
        for (slot, label) in stack.labels.iter_mut().zip(labels.iter()) {
            *slot = *label & MPLS_LABEL_MASK;
        }
        stack
    }
}

impl fmt::Display for LabelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.labels[0], self.labels[1], self.labels[2]
        )
    }
}

/// A decoded packet as handed to the cache. Borrows the payload from the
/// capture buffer, nothing here owns packet bytes.
#[derive(Debug, Clone)]
pub struct MetaPacket<'a> {
    pub lookup_key: LookupKey,
    pub tcp: Option<TcpHeader>,
    pub payload: &'a [u8],
    pub packet_len: u32, // IP total length
    pub is_fragment: bool,
    pub mpls: Option<LabelStack>,
}

impl Default for MetaPacket<'_> {
    fn default() -> Self {
        MetaPacket {
            lookup_key: Default::default(),
            tcp: None,
            payload: &[],
            packet_len: 0,
            is_fragment: false,
            mpls: None,
        }
    }
}

impl MetaPacket<'_> {
    pub fn is_tcp(&self) -> bool {
        self.lookup_key.is_tcp()
    }

    pub fn is_udp(&self) -> bool {
        self.lookup_key.is_udp()
    }
}

impl fmt::Display for MetaPacket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} len: {}", self.lookup_key, self.packet_len)?;
        if let Some(t) = self.tcp.as_ref() {
            write!(f, " tcp: seq {} ack {} [{}]", t.seq, t.ack, t.flags)?;
        }
        if let Some(m) = self.mpls.as_ref() {
            write!(f, " mpls: {}", m)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_stack_masks_and_truncates() {
        let stack = LabelStack::new(&[0xfff0_0001, 2, 3, 4]);
        assert_eq!(stack.labels, [1, 2, 3]);
        assert_eq!(LabelStack::new(&[7]).labels, [7, 0, 0]);
        assert_eq!(LabelStack::new(&[7]), LabelStack::new(&[7, 0]));
    }
}

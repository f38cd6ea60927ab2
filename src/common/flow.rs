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

use std::{
    fmt::{self, Display},
    mem::swap,
    net::{IpAddr, Ipv4Addr},
};

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Serialize, Serializer};

use super::enums::{IpProtocol, TcpFlags};
use super::timestamp::{timestamp_to_millis, Timestamp};

use crate::flow_cache::capture::CaptureBuffer;
use crate::utils::hasher::jenkins64_fold32;

/// Canonical conversation identity. Keys are normalized before they reach
/// the index (VLAN masked or zeroed, netif zeroed per policy), so structural
/// equality and the derived Hash agree with the configured identity.
#[derive(Serialize, PartialEq, Eq, Hash, Debug, Clone)]
pub struct FlowKey {
    /* L3 ipv4 or ipv6 */
    pub ip_src: IpAddr,
    pub ip_dst: IpAddr,
    /* L4, ICMP type/code packed into port_src/port_dst by the decoder */
    pub port_src: u16,
    pub port_dst: u16,
    #[serde(rename = "protocol")]
    pub proto: IpProtocol,
    pub vlan: u16,
    pub netif: u32,
}

impl FlowKey {
    pub fn reverse(&mut self) {
        swap(&mut self.ip_src, &mut self.ip_dst);
        // ICMP "ports" are type/code, directional identifiers that do not
        // swap with the peers.
        if !self.proto.is_icmp() {
            swap(&mut self.port_src, &mut self.port_dst);
        }
    }

    pub fn reversed(&self) -> Self {
        let mut key = self.clone();
        key.reverse();
        key
    }

    // Stable 32-bit identity hash, carried on the record and used to key
    // collaborator-side state. Consistent with Eq by construction: every
    // field folded here takes part in equality.
    pub fn hash(&self) -> u32 {
        fn addr_word(ip: &IpAddr) -> u32 {
            match ip {
                IpAddr::V4(a) => u32::from(*a),
                IpAddr::V6(a) => {
                    let o = a.octets();
                    let mut word = 0;
                    for chunk in o.chunks(4) {
                        word ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    }
                    word
                }
            }
        }
        let version: u32 = if self.ip_src.is_ipv4() { 4 } else { 6 };
        let upper = ((self.port_src as u64) << 16) | self.port_dst as u64;
        let lower = addr_word(&self.ip_src)
            ^ addr_word(&self.ip_dst)
            ^ ((u8::from(self.proto) as u32) << 12)
            ^ (version << 4)
            ^ ((self.vlan as u32) << 20)
            ^ self.netif;
        jenkins64_fold32((upper << 32) | lower as u64)
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        FlowKey {
            ip_src: Ipv4Addr::UNSPECIFIED.into(),
            ip_dst: Ipv4Addr::UNSPECIFIED.into(),
            port_src: 0,
            port_dst: 0,
            proto: IpProtocol::default(),
            vlan: 0,
            netif: 0,
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} > {}.{}, proto: {:?}, vlan: {}, netif: {}",
            self.ip_src, self.port_src, self.ip_dst, self.port_dst, self.proto, self.vlan,
            self.netif,
        )
    }
}

#[derive(Serialize, Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CloseType {
    Unknown = 0,
    Idle = 1,          // no packet for idle-timeout
    ActiveTimeout = 2, // long conversation segmented into export units
    Resource = 3,      // oldest flow evicted over the live-flow bound
    Forced = 4,        // shutdown flush
    Closed = 5,        // TCP teardown observed (FIN/FIN-ACK both ways or RST)
    UdpForce = 6,      // per-datagram uniflow split
}

impl Default for CloseType {
    fn default() -> Self {
        CloseType::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketDirection {
    Forward = FlowPeer::FWD as u8,
    Reverse = FlowPeer::REV as u8,
}

impl PacketDirection {
    pub fn reversed(&self) -> Self {
        match self {
            PacketDirection::Forward => PacketDirection::Reverse,
            PacketDirection::Reverse => PacketDirection::Forward,
        }
    }
}

impl Default for PacketDirection {
    fn default() -> PacketDirection {
        PacketDirection::Forward
    }
}

impl Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "fwd"),
            Self::Reverse => write!(f, "rev"),
        }
    }
}

bitflags! {
    /// TCP completion tracking, one FIN/FIN-ACK pair per direction plus a
    /// flow-wide RST.
    #[derive(Default)]
    pub struct CloseState: u8 {
        const FIN_FWD = 0b00001;
        const FIN_ACK_FWD = 0b00010;
        const FIN_REV = 0b00100;
        const FIN_ACK_REV = 0b01000;
        const RST = 0b10000;
    }
}

impl CloseState {
    pub fn fin(dir: PacketDirection) -> Self {
        match dir {
            PacketDirection::Forward => CloseState::FIN_FWD,
            PacketDirection::Reverse => CloseState::FIN_REV,
        }
    }

    pub fn fin_ack(dir: PacketDirection) -> Self {
        match dir {
            PacketDirection::Forward => CloseState::FIN_ACK_FWD,
            PacketDirection::Reverse => CloseState::FIN_ACK_REV,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.contains(CloseState::RST)
            || self.contains(CloseState::FIN_ACK_FWD | CloseState::FIN_ACK_REV)
    }
}

bitflags! {
    #[derive(Default)]
    pub struct PeerAttributes: u8 {
        // every packet of this peer so far had the first packet's IP length
        const SAME_SIZE = 0b001;
        // a TCP segment arrived below the next expected sequence
        const OUT_OF_ORDER = 0b010;
        // the decoder reported an MPTCP token on this peer
        const MPTCP = 0b100;
    }
}

/// Optional per-direction running statistics, allocated only when enabled.
#[derive(Serialize, Debug, Default, Clone, Copy)]
pub struct PeerStats {
    pub pkt_size_min: u32,
    pub pkt_size_max: u32,
    #[serde(serialize_with = "timestamp_to_millis")]
    pub iat_min: Timestamp,
    #[serde(serialize_with = "timestamp_to_millis")]
    pub iat_max: Timestamp,
    #[serde(serialize_with = "timestamp_to_millis")]
    pub iat_sum: Timestamp,
    pub nonempty_packets: u64,
}

impl PeerStats {
    pub fn update(&mut self, pkt_len: u32, payload_len: usize, iat: Option<Timestamp>) {
        if self.pkt_size_min == 0 || pkt_len < self.pkt_size_min {
            self.pkt_size_min = pkt_len;
        }
        if pkt_len > self.pkt_size_max {
            self.pkt_size_max = pkt_len;
        }
        if let Some(iat) = iat {
            if self.iat_sum.is_zero() || iat < self.iat_min {
                self.iat_min = iat;
            }
            if iat > self.iat_max {
                self.iat_max = iat;
            }
            self.iat_sum += iat;
        }
        if payload_len > 0 {
            self.nonempty_packets += 1;
        }
    }
}

/// One directional half of a flow.
#[derive(Serialize, Debug, Default, Clone)]
pub struct FlowPeer {
    pub packet_count: u64,
    pub byte_count: u64, // sum of IP total lengths
    #[serde(serialize_with = "timestamp_to_millis")]
    pub first: Timestamp,
    #[serde(serialize_with = "timestamp_to_millis")]
    pub last: Timestamp,

    /* TCP */
    pub isn: u32,      // fixed by the peer's first packet
    pub next_seq: u32, // highest seq + payload seen
    #[serde(serialize_with = "tcp_flags_to_bits")]
    pub tcp_flags_first: TcpFlags,
    #[serde(serialize_with = "tcp_flags_to_bits")]
    pub tcp_flags_union: TcpFlags,
    pub mptcp_token: u32,

    pub first_pkt_size: u32,
    #[serde(serialize_with = "peer_attributes_to_bits")]
    pub attributes: PeerAttributes,

    #[serde(skip)]
    pub payload: Option<Box<CaptureBuffer>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Box<PeerStats>>,
}

impl FlowPeer {
    pub const FWD: usize = 0;
    pub const REV: usize = 1;
}

pub fn tcp_flags_to_bits<S>(f: &TcpFlags, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u8(f.bits())
}

pub fn peer_attributes_to_bits<S>(a: &PeerAttributes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u8(a.bits())
}

pub fn close_state_to_bits<S>(s: &CloseState, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u8(s.bits())
}

/// The bidirectional flow record. `peers[0]` accumulates the orientation the
/// conversation was first seen in, `peers[1]` the reverse.
#[derive(Serialize, Debug, Default, Clone)]
pub struct Flow {
    #[serde(flatten)]
    pub key: FlowKey,
    pub key_hash: u32,

    pub peers: [FlowPeer; 2],

    #[serde(serialize_with = "timestamp_to_millis")]
    pub start_time: Timestamp,
    #[serde(serialize_with = "timestamp_to_millis")]
    pub end_time: Timestamp,
    // first reverse packet time minus start time, drives the synthesized
    // reverse record timestamp in uniflow export
    #[serde(serialize_with = "timestamp_to_millis")]
    pub reverse_delta: Timestamp,

    pub close_type: CloseType,
    // set on the record re-opened after an active-timeout segmentation
    pub is_continuation: bool,
    #[serde(serialize_with = "close_state_to_bits")]
    pub close_state: CloseState,

    // ToS of the first reverse packet, for asymmetric reporting
    pub reverse_tos: u8,

    /* populated by the labeler collaborator, not interpreted here */
    pub app_label: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip)]
    pub first_banner: Option<Vec<u8>>,

    // selected by the packet-capture collaborator's filter at creation
    #[serde(skip)]
    pub dumped: bool,
}

impl Flow {
    pub fn duration(&self) -> Timestamp {
        self.end_time.saturating_sub(self.start_time)
    }

    pub fn peer(&self, dir: PacketDirection) -> &FlowPeer {
        &self.peers[dir as usize]
    }

    pub fn peer_mut(&mut self, dir: PacketDirection) -> &mut FlowPeer {
        &mut self.peers[dir as usize]
    }
}

impl Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} start: {:?} end: {:?} close: {:?} packets: {}/{} bytes: {}/{}",
            self.key,
            self.start_time,
            self.end_time,
            self.close_type,
            self.peers[FlowPeer::FWD].packet_count,
            self.peers[FlowPeer::REV].packet_count,
            self.peers[FlowPeer::FWD].byte_count,
            self.peers[FlowPeer::REV].byte_count,
        )
    }
}

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
use std::mem::swap;
use std::net::{IpAddr, Ipv4Addr};

use super::enums::IpProtocol;
use super::flow::FlowKey;
use super::timestamp::Timestamp;

// Only the low 12 bits of a 802.1Q tag identify the VLAN, the priority and
// CFI bits must not distinguish flows.
pub const VLAN_ID_MASK: u16 = 0x0fff;

/// Which optional tuple members take part in flow identity. Derived from
/// configuration once and applied when a packet key is canonicalized, so the
/// index can compare keys structurally.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyPolicy {
    pub vlan_in_key: bool,
    pub netif_in_key: bool,
}

/// The decoded per-packet tuple before canonicalization.
#[derive(Clone, Debug)]
pub struct LookupKey {
    pub timestamp: Timestamp,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: IpProtocol,
    pub vlan: u16,
    pub netif: u32,
    pub tos: u8,
}

impl Default for LookupKey {
    fn default() -> Self {
        LookupKey {
            timestamp: Timestamp::ZERO,
            src_ip: Ipv4Addr::UNSPECIFIED.into(),
            dst_ip: Ipv4Addr::UNSPECIFIED.into(),
            src_port: 0,
            dst_port: 0,
            proto: Default::default(),
            vlan: 0,
            netif: 0,
            tos: 0,
        }
    }
}

impl LookupKey {
    pub fn is_tcp(&self) -> bool {
        self.proto == IpProtocol::Tcp
    }

    pub fn is_udp(&self) -> bool {
        self.proto == IpProtocol::Udp
    }

    pub fn reverse(&mut self) {
        swap(&mut self.src_ip, &mut self.dst_ip);
        swap(&mut self.src_port, &mut self.dst_port);
    }

    /// Canonicalizes into the forward-orientation FlowKey, zeroing tuple
    /// members the policy keeps out of flow identity.
    pub fn flow_key(&self, policy: KeyPolicy) -> FlowKey {
        FlowKey {
            ip_src: self.src_ip,
            ip_dst: self.dst_ip,
            port_src: self.src_port,
            port_dst: self.dst_port,
            proto: self.proto,
            vlan: if policy.vlan_in_key {
                self.vlan & VLAN_ID_MASK
            } else {
                0
            },
            netif: if policy.netif_in_key { self.netif } else { 0 },
        }
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}.{} > {}.{}, proto: {:?}, vlan: {}, netif: {}, tos: {}",
            self.timestamp,
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.proto,
            self.vlan,
            self.netif,
            self.tos,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_policy_masks_priority_bits() {
        let key = LookupKey {
            vlan: 0xe064,
            ..Default::default()
        };
        let with = key.flow_key(KeyPolicy {
            vlan_in_key: true,
            netif_in_key: false,
        });
        assert_eq!(with.vlan, 0x064);
        let without = key.flow_key(KeyPolicy::default());
        assert_eq!(without.vlan, 0);
    }
}

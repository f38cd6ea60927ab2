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

use std::cell::RefCell;
use std::cmp;
use std::net::Ipv4Addr;
use std::ptr;
use std::rc::Rc;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    mpsc, Arc,
};

use ahash::AHashMap;
use log::{debug, warn};

use super::capture::CaptureBuffer;
use super::error::Result;
use super::export::{reverse_uniflow, AppLabeler, FlowExporter, PacketDumper};
use super::node::FlowNode;
use super::partition::{LabelPartition, PartitionTable};
use super::queue::FlowQueue;
use super::tcp;
use crate::common::enums::{IpProtocol, TcpFlags};
use crate::common::flow::{CloseType, Flow, FlowKey, FlowPeer, PacketDirection, PeerAttributes};
use crate::common::lookup_key::{KeyPolicy, LookupKey};
use crate::common::meta_packet::{LabelStack, TcpHeader};
use crate::common::{MetaPacket, Timestamp};
use crate::config::FlowConfig;

#[derive(Default)]
pub struct FlowCacheCounter {
    pub new: AtomicU64,            // records created
    pub closed: AtomicU64,         // records closed, whatever the reason
    pub drop_by_window: AtomicU64, // packets older than the clock, rejected
    pub concurrent: AtomicU64,     // records currently active
    pub concurrent_max: AtomicU64, // high water of concurrent
    pub partitions: AtomicU64,     // live MPLS label partitions
    pub dump_errors: AtomicU64,    // packet dump callback failures
    pub flush_count: AtomicU64,    // flush cycles actually run
}

/// Bounded cache of active flow records, fed packet metadata and drained
/// into a [`FlowExporter`].
///
/// Single threaded and run to completion: time is a logical clock driven by
/// packet timestamps (and ticker injection between batches), so feeding the
/// same packet sequence twice produces the same records. One instance per
/// pipeline shard, no cross-shard state.
pub struct FlowCache {
    config: FlowConfig,
    policy: KeyPolicy,

    // logical clock, the largest timestamp seen
    clock: Timestamp,
    last_flush: Timestamp,

    index: AHashMap<FlowKey, *mut FlowNode>,
    partitions: PartitionTable,
    // active: ordered by end_time, non-increasing head to tail
    active: FlowQueue,
    // closed: FIFO awaiting export
    closed: FlowQueue,

    output: Box<dyn FlowExporter>,
    labeler: Option<Box<dyn AppLabeler>>,
    dumper: Option<Box<dyn PacketDumper>>,

    counter: Arc<FlowCacheCounter>,
}

impl FlowCache {
    pub fn new(config: FlowConfig, output: Box<dyn FlowExporter>) -> Self {
        let policy = config.key_policy();
        Self {
            index: AHashMap::with_capacity(config.hash_slots as usize),
            partitions: PartitionTable::new(),
            active: FlowQueue::new(),
            closed: FlowQueue::new(),
            clock: Timestamp::ZERO,
            last_flush: Timestamp::ZERO,
            output,
            labeler: None,
            dumper: None,
            counter: Arc::new(FlowCacheCounter::default()),
            policy,
            config,
        }
    }

    pub fn set_app_labeler(&mut self, labeler: Box<dyn AppLabeler>) {
        self.labeler = Some(labeler);
    }

    pub fn set_packet_dumper(&mut self, dumper: Box<dyn PacketDumper>) {
        self.dumper = Some(dumper);
    }

    pub fn counter(&self) -> Arc<FlowCacheCounter> {
        self.counter.clone()
    }

    /// Active records.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Closed records awaiting export.
    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    pub fn has_partition(&self, stack: &LabelStack) -> bool {
        self.partitions.contains(stack)
    }

    /// Ingests one packet's metadata: attributes it to its record, creating
    /// or recycling one as needed, and updates recency ordering. TCP
    /// teardown and per-datagram uniflow policy may close the record on the
    /// spot; nothing is exported until the next flush.
    pub fn inject_meta_packet(&mut self, packet: &MetaPacket) {
        let timestamp = packet.lookup_key.timestamp;
        let late = timestamp < self.clock;
        if late && !self.config.accept_out_of_order {
            self.counter.drop_by_window.fetch_add(1, Ordering::Relaxed);
            debug!(
                "dropped packet at {:?} behind clock {:?}",
                timestamp, self.clock
            );
            return;
        }
        if !late {
            self.clock = timestamp;
        }

        let key = packet.lookup_key.flow_key(self.policy);
        let partition = match (self.config.mpls_enabled, packet.mpls) {
            (true, Some(stack)) => Some(self.partitions.get_or_create(stack)),
            _ => None,
        };
        self.counter
            .partitions
            .store(self.partitions.len() as u64, Ordering::Relaxed);

        let (node, direction) = self.lookup_or_create(key, partition, packet, late);
        // SAFTY:
        // - node was just returned alive, indexed and linked in the active queue
        unsafe {
            self.update_node(node, direction, packet, late);
            debug_assert!(self.active.is_time_ordered());
        }
    }

    /// Raises the logical clock without a packet, then runs a regular flush.
    /// Ticker time in the past never turns the clock back.
    pub fn inject_flush_ticker(&mut self, now: Timestamp) -> Result<()> {
        if now > self.clock {
            self.clock = now;
        }
        self.flush(false)
    }

    /// One flush cycle: evicts idle records from the cold end of the active
    /// queue, enforces the record bound, drains everything when `forced`,
    /// then hands the closed queue to the exporter.
    ///
    /// An unforced flush right after the previous one is skipped outright
    /// while the closed backlog is shallow. Export errors abort the drain
    /// and propagate; affected records stay queued for the next flush.
    pub fn flush(&mut self, forced: bool) -> Result<()> {
        let now = self.clock;
        if !forced
            && now.saturating_sub(self.last_flush) < self.config.flush_delay
            && (self.closed.len() as u32) < self.config.flush_backlog
        {
            return Ok(());
        }
        self.last_flush = now;
        self.counter.flush_count.fetch_add(1, Ordering::Relaxed);

        // SAFTY:
        // - tail nodes are alive, indexed and linked until close_node takes them
        unsafe {
            // oldest first, stop at the first record still inside the window
            while !self.active.is_empty() {
                let tail = self.active.tail();
                if now.saturating_sub((*tail).flow.end_time) > self.config.idle_timeout {
                    self.close_node(tail, CloseType::Idle);
                } else {
                    break;
                }
            }
            if self.config.flow_count_max > 0 {
                while self.active.len() > self.config.flow_count_max as usize {
                    self.close_node(self.active.tail(), CloseType::Resource);
                }
            }
            if forced {
                while !self.active.is_empty() {
                    self.close_node(self.active.tail(), CloseType::Forced);
                }
            }
        }
        self.drain_closed()
    }

    fn lookup_or_create(
        &mut self,
        key: FlowKey,
        partition: Option<Rc<RefCell<LabelPartition>>>,
        packet: &MetaPacket,
        late: bool,
    ) -> (*mut FlowNode, PacketDirection) {
        let now = self.clock;
        let hit = {
            let probe = |k: &FlowKey| -> Option<*mut FlowNode> {
                match partition.as_ref() {
                    Some(p) => p.borrow().index.get(k).copied(),
                    None => self.index.get(k).copied(),
                }
            };
            match probe(&key) {
                Some(node) => Some((node, PacketDirection::Forward)),
                None => probe(&key.reversed()).map(|node| (node, PacketDirection::Reverse)),
            }
        };

        let Some((node, direction)) = hit else {
            return self.create_node(key, partition, packet, late, None);
        };

        // SAFTY:
        // - indexed nodes are alive and nothing else borrows them here
        unsafe {
            let end_time = (*node).flow.end_time;
            if now.saturating_sub(end_time) > self.config.idle_timeout {
                // the record had already expired when this packet arrived,
                // it must not soak up the new conversation
                self.close_node(node, CloseType::Idle);
                return self.create_node(key, partition, packet, late, None);
            }
            let start_time = (*node).flow.start_time;
            if now.saturating_sub(start_time) > self.config.active_timeout {
                self.close_node(node, CloseType::ActiveTimeout);
                // the labeler just ran on the closed record, carry its
                // verdict into the continuation
                let label = (*node).flow.app_label;
                return self.create_node(key, partition, packet, late, Some(label));
            }
        }
        (node, direction)
    }

    fn create_node(
        &mut self,
        key: FlowKey,
        partition: Option<Rc<RefCell<LabelPartition>>>,
        packet: &MetaPacket,
        late: bool,
        inherited_label: Option<u16>,
    ) -> (*mut FlowNode, PacketDirection) {
        let timestamp = packet.lookup_key.timestamp;
        let mut flow = Flow {
            key_hash: key.hash(),
            key: key.clone(),
            start_time: timestamp,
            end_time: timestamp,
            ..Default::default()
        };
        if let Some(label) = inherited_label {
            flow.app_label = label;
            flow.is_continuation = true;
        }
        if let Some(dumper) = self.dumper.as_mut() {
            flow.dumped = dumper.matches(&flow);
        }

        let node = FlowNode::alloc(flow);
        // SAFTY:
        // - node is freshly allocated, not yet linked anywhere
        unsafe {
            let displaced = match partition {
                Some(p) => {
                    let displaced = p.borrow_mut().index.insert(key, node);
                    (*node).partition = Some(p);
                    displaced
                }
                None => self.index.insert(key, node),
            };
            // one index entry per record
            debug_assert!(displaced.is_none());

            if late {
                self.active.insert_by_time(node);
            } else {
                self.active.push_front(node);
            }
        }

        self.counter.new.fetch_add(1, Ordering::Relaxed);
        let concurrent = self.active.len() as u64;
        self.counter.concurrent.store(concurrent, Ordering::Relaxed);
        if concurrent > self.counter.concurrent_max.load(Ordering::Relaxed) {
            self.counter
                .concurrent_max
                .store(concurrent, Ordering::Relaxed);
        }
        (node, PacketDirection::Forward)
    }

    // SAFTY: node must be alive, indexed and linked in the active queue
    unsafe fn update_node(
        &mut self,
        node: *mut FlowNode,
        direction: PacketDirection,
        packet: &MetaPacket,
        late: bool,
    ) {
        let timestamp = packet.lookup_key.timestamp;
        {
            let flow = &mut *(*node).flow;
            if direction == PacketDirection::Reverse
                && flow.peers[FlowPeer::REV].packet_count == 0
            {
                if flow.reverse_delta.is_zero() {
                    flow.reverse_delta = timestamp.saturating_sub(flow.start_time);
                }
                if flow.reverse_tos == 0 {
                    flow.reverse_tos = packet.lookup_key.tos;
                }
            }

            let first = flow.peers[direction as usize].packet_count == 0;
            {
                let peer = &mut flow.peers[direction as usize];
                let iat = if peer.last.is_zero() {
                    None
                } else {
                    Some(timestamp.saturating_sub(peer.last))
                };
                peer.packet_count += 1;
                peer.byte_count += packet.packet_len as u64;
                if peer.first.is_zero() {
                    peer.first = timestamp;
                }
                peer.last = cmp::max(peer.last, timestamp);
                if first {
                    peer.first_pkt_size = packet.packet_len;
                    peer.attributes.insert(PeerAttributes::SAME_SIZE);
                } else if packet.packet_len != peer.first_pkt_size {
                    peer.attributes.remove(PeerAttributes::SAME_SIZE);
                }
                if self.config.stats_enabled {
                    peer.stats.get_or_insert_with(Default::default).update(
                        packet.packet_len,
                        packet.payload.len(),
                        iat,
                    );
                }
            }

            if packet.lookup_key.is_tcp() {
                if let Some(tcp_header) = packet.tcp.as_ref() {
                    tcp::update_peer(flow, direction, tcp_header, packet.payload.len(), first);
                }
            }

            capture_payload(&self.config, flow, direction, packet);
        }

        if (*node).flow.dumped {
            if let Some(dumper) = self.dumper.as_mut() {
                if let Err(e) = dumper.dump((*node).flow.key_hash, &(*node).flow, packet) {
                    self.counter.dump_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("packet dump failed for {}: {}", (*node).flow.key, e);
                }
            }
        }

        // recency: in-order packets always make this record the freshest,
        // late ones only re-place it if they still advanced end_time
        if late {
            if timestamp > (*node).flow.end_time {
                (*node).flow.end_time = timestamp;
                self.active.restore_order(node);
            }
        } else {
            (*node).flow.end_time = timestamp;
            self.active.move_to_front(node);
        }

        if packet.lookup_key.is_tcp() {
            if let Some(tcp_header) = packet.tcp.as_ref() {
                if tcp::advance_close_state(&mut (*node).flow, direction, tcp_header.flags) {
                    self.close_node(node, CloseType::Closed);
                    return;
                }
            }
        }

        if packet.lookup_key.is_udp() {
            let applies = self.udp_uniflow_applies(&(*node).flow.key);
            if applies {
                self.split_udp_uniflow(node, direction);
            }
        }
    }

    fn udp_uniflow_applies(&self, key: &FlowKey) -> bool {
        match self.config.udp_uniflow_port {
            0 => false,
            1 => true,
            port => key.port_src == port || key.port_dst == port,
        }
    }

    /// Moves the datagram just accounted to `direction` into its own closed
    /// record, leaving the bidirectional record active so both directions
    /// keep accumulating shared state.
    ///
    /// SAFTY: node must be alive and just updated for `direction`
    unsafe fn split_udp_uniflow(&mut self, node: *mut FlowNode, direction: PacketDirection) {
        let uni = {
            let flow = &mut *(*node).flow;
            debug_assert!(flow.peers[direction as usize].packet_count > 0);
            let peer = std::mem::take(&mut flow.peers[direction as usize]);
            let mut uni = Flow {
                key: flow.key.clone(),
                key_hash: flow.key_hash,
                start_time: peer.first,
                end_time: peer.last,
                reverse_delta: flow.reverse_delta,
                close_type: CloseType::UdpForce,
                is_continuation: flow.is_continuation,
                reverse_tos: flow.reverse_tos,
                app_label: flow.app_label,
                os_name: flow.os_name.clone(),
                os_version: flow.os_version.clone(),
                ..Default::default()
            };
            uni.peers[direction as usize] = peer;
            uni
        };

        let uni_node = FlowNode::alloc(uni);
        // never indexed: the record is born closed
        if let Some(labeler) = self.labeler.as_mut() {
            labeler.label(&mut (*uni_node).flow);
        }
        self.closed.push_back(uni_node);
        self.counter.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Ends an active record: stamps the close reason, runs the labeler,
    /// and moves the node from index plus active queue to the closed queue
    /// in one step, so a record is never reachable from both sides.
    ///
    /// SAFTY: node must be alive, indexed and linked in the active queue
    unsafe fn close_node(&mut self, node: *mut FlowNode, close_type: CloseType) {
        {
            let flow = &mut *(*node).flow;
            debug_assert_eq!(flow.close_type, CloseType::Unknown);
            flow.close_type = close_type;
            if let Some(labeler) = self.labeler.as_mut() {
                labeler.label(flow);
            }
        }
        let removed = match (*node).partition.as_ref() {
            Some(p) => p.borrow_mut().index.remove(&(*node).flow.key),
            None => self.index.remove(&(*node).flow.key),
        };
        debug_assert!(matches!(removed, Some(p) if ptr::eq(p, node)));
        self.active.unlink(node);
        self.closed.push_back(node);
        self.counter.closed.fetch_add(1, Ordering::Relaxed);
        self.counter
            .concurrent
            .store(self.active.len() as u64, Ordering::Relaxed);
        debug!("flow closed: {}", (*node).flow);
    }

    fn drain_closed(&mut self) -> Result<()> {
        // SAFTY:
        // - closed nodes are alive and unindexed; each is freed exactly once,
        //   only after the exporter took every piece of it
        unsafe {
            loop {
                let node = self.closed.head();
                if node.is_null() {
                    break;
                }
                let flow = &mut *(*node).flow;
                let has_packets = flow.peers[FlowPeer::FWD].packet_count > 0
                    || flow.peers[FlowPeer::REV].packet_count > 0;
                if has_packets {
                    if self.config.uniflow_export {
                        // reverse piece goes first: once it is out, the peer
                        // is stripped, so a failed forward export retries
                        // without duplicating the reverse record
                        if flow.peers[FlowPeer::REV].packet_count > 0 {
                            let reverse = reverse_uniflow(flow);
                            self.output.export(&reverse)?;
                            flow.peers[FlowPeer::REV] = FlowPeer::default();
                        }
                        if flow.peers[FlowPeer::FWD].packet_count > 0 {
                            self.output.export(flow)?;
                        }
                    } else {
                        self.output.export(flow)?;
                    }
                }
                // fully split shells with no packets left are dropped quietly
                let head = self.closed.pop_front();
                debug_assert_eq!(head, node);
                let freed = FlowNode::free(head);
                if let Some(partition) = freed.partition {
                    self.partitions.release(partition);
                }
            }
        }
        self.counter
            .partitions
            .store(self.partitions.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

fn capture_payload(
    config: &FlowConfig,
    flow: &mut Flow,
    direction: PacketDirection,
    packet: &MetaPacket,
) {
    if config.payload_cap == 0 || packet.payload.is_empty() || packet.is_fragment {
        return;
    }
    let peer = &mut flow.peers[direction as usize];
    if packet.lookup_key.is_tcp() {
        let Some(tcp_header) = packet.tcp.as_ref() else {
            return;
        };
        let buffer = peer
            .payload
            .get_or_insert_with(|| Box::new(CaptureBuffer::new(config.payload_cap)));
        // stream position, so reordered segments land where they belong and
        // retransmissions overwrite themselves
        let offset = tcp_header.seq.wrapping_sub(peer.isn);
        buffer.write_at(offset, packet.payload);
    } else {
        let multi = config.udp_multipkt_capture && packet.lookup_key.is_udp();
        match peer.payload.as_mut() {
            Some(buffer) if multi => {
                buffer.append(packet.payload);
            }
            Some(_) => {} // single shot capture already taken
            None => {
                let mut buffer = Box::new(CaptureBuffer::new(config.payload_cap));
                buffer.append(packet.payload);
                peer.payload = Some(buffer);
            }
        }
    }
}

pub fn _new_flow_cache(config: FlowConfig) -> (FlowCache, mpsc::Receiver<Box<Flow>>) {
    let (sender, receiver) = mpsc::channel();
    (FlowCache::new(config, Box::new(sender)), receiver)
}

pub fn _new_meta_packet<'a>() -> MetaPacket<'a> {
    let mut packet = MetaPacket::default();
    packet.lookup_key = LookupKey {
        timestamp: Timestamp::from_secs(10),
        src_ip: Ipv4Addr::new(192, 168, 1, 1).into(),
        dst_ip: Ipv4Addr::new(192, 168, 1, 10).into(),
        src_port: 12345,
        dst_port: 443,
        proto: IpProtocol::Tcp,
        ..Default::default()
    };
    packet.tcp = Some(TcpHeader {
        seq: 111,
        ack: 0,
        flags: TcpFlags::SYN,
        mptcp_token: None,
    });
    packet.packet_len = 64;
    packet
}

pub fn _reverse_meta_packet(packet: &mut MetaPacket) {
    packet.lookup_key.reverse();
}

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

use std::io;
use std::sync::mpsc;

use super::error::{Error, Result};
use crate::common::flow::{Flow, FlowPeer};
use crate::common::{MetaPacket, Timestamp};

/// Sink for closed flow records.
///
/// `export` borrows the record: on failure the cache keeps the record queued
/// and retries it on the next flush, so exporters must not assume a record
/// is seen at most once until they have returned `Ok`.
pub trait FlowExporter {
    fn export(&mut self, flow: &Flow) -> Result<()>;
}

/// An mpsc sender works directly as an exporter, which is also how the tests
/// and benches observe cache output.
impl FlowExporter for mpsc::Sender<Box<Flow>> {
    fn export(&mut self, flow: &Flow) -> Result<()> {
        self.send(Box::new(flow.clone()))
            .map_err(|_| Error::Export("flow receiver dropped".to_owned()))
    }
}

/// Application labeling callback, run once per record at close time, before
/// the record enters the closed queue. The implementation typically inspects
/// the captured payload and fills `app_label`, the OS fields and the banner;
/// the cache stores but never interprets them.
pub trait AppLabeler {
    fn label(&mut self, flow: &mut Flow);
}

impl<F> AppLabeler for F
where
    F: FnMut(&mut Flow),
{
    fn label(&mut self, flow: &mut Flow) {
        self(flow)
    }
}

/// Optional per-flow packet capture hook.
///
/// `matches` runs once when a record is created and decides whether the
/// flow's packets are handed to `dump`. Dump failures are counted and logged
/// by the cache but never fail packet ingestion.
pub trait PacketDumper {
    fn matches(&mut self, flow: &Flow) -> bool;
    fn dump(&mut self, flow_hash: u32, flow: &Flow, packet: &MetaPacket) -> io::Result<()>;
}

/// Builds the reverse-direction record for unidirectional export: the
/// reverse peer under the reversed key, starting `reverse_delta` after the
/// original flow. Completion state and application fields are carried over
/// as conversation-level facts; the banner stays with the forward record.
pub(crate) fn reverse_uniflow(flow: &Flow) -> Flow {
    let mut key = flow.key.clone();
    key.reverse();
    let key_hash = key.hash();
    Flow {
        key,
        key_hash,
        peers: [flow.peers[FlowPeer::REV].clone(), FlowPeer::default()],
        start_time: flow.start_time + flow.reverse_delta,
        end_time: flow.end_time,
        reverse_delta: Timestamp::ZERO,
        close_type: flow.close_type,
        is_continuation: flow.is_continuation,
        close_state: flow.close_state,
        reverse_tos: 0,
        app_label: flow.app_label,
        os_name: flow.os_name.clone(),
        os_version: flow.os_version.clone(),
        first_banner: None,
        dumped: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::flow::CloseType;

    #[test]
    fn reverse_uniflow_flips_key_and_shifts_start() {
        let mut flow = Flow::default();
        flow.key.port_src = 1234;
        flow.key.port_dst = 53;
        flow.key_hash = flow.key.hash();
        flow.start_time = Timestamp::from_secs(100);
        flow.end_time = Timestamp::from_secs(130);
        flow.reverse_delta = Timestamp::from_millis(250);
        flow.close_type = CloseType::Idle;
        flow.app_label = 53;
        flow.peers[FlowPeer::REV].packet_count = 7;
        flow.peers[FlowPeer::REV].byte_count = 700;

        let rev = reverse_uniflow(&flow);
        assert_eq!(rev.key.port_src, 53);
        assert_eq!(rev.key.port_dst, 1234);
        assert_eq!(rev.key_hash, rev.key.hash());
        assert_eq!(rev.start_time, Timestamp::from_millis(100_250));
        assert_eq!(rev.end_time, flow.end_time);
        assert_eq!(rev.close_type, CloseType::Idle);
        assert_eq!(rev.app_label, 53);
        assert_eq!(rev.peers[FlowPeer::FWD].packet_count, 7);
        assert_eq!(rev.peers[FlowPeer::FWD].byte_count, 700);
        assert_eq!(rev.peers[FlowPeer::REV].packet_count, 0);
    }

    #[test]
    fn sender_exporter_fails_without_receiver() {
        let (tx, rx) = mpsc::channel::<Box<Flow>>();
        let mut tx = tx;
        assert!(tx.export(&Flow::default()).is_ok());
        drop(rx);
        assert!(tx.export(&Flow::default()).is_err());
    }

    #[test]
    fn closures_are_labelers() {
        let mut labeler = |flow: &mut Flow| flow.app_label = 80;
        let mut flow = Flow::default();
        AppLabeler::label(&mut labeler, &mut flow);
        assert_eq!(flow.app_label, 80);
    }
}

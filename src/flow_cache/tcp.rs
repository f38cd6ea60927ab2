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

use crate::common::enums::TcpFlags;
use crate::common::flow::{CloseState, Flow, PacketDirection, PeerAttributes};
use crate::common::meta_packet::TcpHeader;

// SYN and FIN each occupy one unit of sequence space.
fn next_expected(tcp: &TcpHeader, payload_len: usize) -> u32 {
    let ghost = tcp.flags.contains(TcpFlags::SYN) as u32 + tcp.flags.contains(TcpFlags::FIN) as u32;
    tcp.seq.wrapping_add(payload_len as u32).wrapping_add(ghost)
}

// seq arithmetic is modular, signed distance decides ordering
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Per-direction TCP bookkeeping: ISN and first flags on the opening packet,
/// cumulative flag union, next expected sequence, reorder detection, MPTCP
/// token capture. Runs before payload capture so `isn` is valid when the
/// capture offset is computed.
pub(crate) fn update_peer(
    flow: &mut Flow,
    direction: PacketDirection,
    tcp: &TcpHeader,
    payload_len: usize,
    first: bool,
) {
    let peer = &mut flow.peers[direction as usize];
    if first {
        peer.isn = tcp.seq;
        peer.tcp_flags_first = tcp.flags;
        peer.next_seq = next_expected(tcp, payload_len);
    } else {
        if seq_before(tcp.seq, peer.next_seq) {
            peer.attributes.insert(PeerAttributes::OUT_OF_ORDER);
        }
        let next = next_expected(tcp, payload_len);
        if seq_before(peer.next_seq, next) {
            peer.next_seq = next;
        }
    }
    peer.tcp_flags_union |= tcp.flags;
    if let Some(token) = tcp.mptcp_token {
        if peer.mptcp_token == 0 {
            peer.mptcp_token = token;
            peer.attributes.insert(PeerAttributes::MPTCP);
        }
    }
}

/// Advances the flow-wide completion state for one packet and reports
/// whether the flow is now terminal.
///
/// A direction's FIN_ACK is only granted while the opposite direction has
/// already sent its FIN, so a plain data ACK early in the conversation never
/// counts as acknowledging a teardown.
pub(crate) fn advance_close_state(
    flow: &mut Flow,
    direction: PacketDirection,
    flags: TcpFlags,
) -> bool {
    if flags.contains(TcpFlags::RST) {
        flow.close_state.insert(CloseState::RST);
    }
    if flags.contains(TcpFlags::ACK)
        && flow.close_state.contains(CloseState::fin(direction.reversed()))
    {
        flow.close_state.insert(CloseState::fin_ack(direction));
    }
    if flags.contains(TcpFlags::FIN) {
        flow.close_state.insert(CloseState::fin(direction));
    }
    flow.close_state.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::flow::PacketDirection::{Forward, Reverse};

    fn header(seq: u32, flags: TcpFlags) -> TcpHeader {
        TcpHeader {
            seq,
            ack: 0,
            flags,
            mptcp_token: None,
        }
    }

    #[test]
    fn graceful_teardown_completes_on_last_ack() {
        let mut flow = Flow::default();
        assert!(!advance_close_state(&mut flow, Forward, TcpFlags::FIN_ACK));
        assert!(!advance_close_state(&mut flow, Reverse, TcpFlags::FIN_ACK));
        assert!(flow.close_state.contains(CloseState::FIN_ACK_REV));
        assert!(advance_close_state(&mut flow, Forward, TcpFlags::ACK));
        assert!(flow.close_state.is_terminal());
    }

    #[test]
    fn rst_is_terminal_alone() {
        let mut flow = Flow::default();
        assert!(advance_close_state(&mut flow, Reverse, TcpFlags::RST_ACK));
        assert!(flow.close_state.contains(CloseState::RST));
    }

    #[test]
    fn early_ack_is_not_a_fin_ack() {
        let mut flow = Flow::default();
        assert!(!advance_close_state(&mut flow, Forward, TcpFlags::PSH_ACK));
        assert!(!advance_close_state(&mut flow, Reverse, TcpFlags::PSH_ACK));
        assert!(flow.close_state.is_empty());
    }

    #[test]
    fn syn_occupies_sequence_space() {
        let mut flow = Flow::default();
        update_peer(&mut flow, Forward, &header(1000, TcpFlags::SYN), 0, true);
        let peer = &flow.peers[PacketDirection::Forward as usize];
        assert_eq!(peer.isn, 1000);
        assert_eq!(peer.next_seq, 1001);
        assert_eq!(peer.tcp_flags_first, TcpFlags::SYN);
    }

    #[test]
    fn retransmission_sets_out_of_order() {
        let mut flow = Flow::default();
        update_peer(&mut flow, Forward, &header(1000, TcpFlags::ACK), 100, true);
        update_peer(&mut flow, Forward, &header(1100, TcpFlags::ACK), 100, false);
        let peer = &flow.peers[PacketDirection::Forward as usize];
        assert_eq!(peer.next_seq, 1200);
        assert!(!peer.attributes.contains(PeerAttributes::OUT_OF_ORDER));

        update_peer(&mut flow, Forward, &header(1100, TcpFlags::ACK), 100, false);
        let peer = &flow.peers[PacketDirection::Forward as usize];
        assert!(peer.attributes.contains(PeerAttributes::OUT_OF_ORDER));
        // retransmission does not move the expectation backwards
        assert_eq!(peer.next_seq, 1200);
    }

    #[test]
    fn mptcp_token_is_sticky() {
        let mut flow = Flow::default();
        let mut tcp = header(1, TcpFlags::SYN);
        tcp.mptcp_token = Some(0xdead);
        update_peer(&mut flow, Forward, &tcp, 0, true);
        tcp.mptcp_token = Some(0xbeef);
        update_peer(&mut flow, Forward, &tcp, 0, false);
        let peer = &flow.peers[PacketDirection::Forward as usize];
        assert_eq!(peer.mptcp_token, 0xdead);
        assert!(peer.attributes.contains(PeerAttributes::MPTCP));
    }
}

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

use std::ptr;

use super::node::FlowNode;

/// Intrusive doubly linked list of flow nodes.
///
/// The active queue keeps nodes ordered by `flow.end_time`, non-increasing
/// from head to tail, so the tail is always the least recently touched
/// record and timeout scans stop at the first fresh one. The closed queue
/// uses the same structure as a plain FIFO.
///
/// The queue owns the nodes linked into it: dropping a non-empty queue frees
/// the remaining chain.
pub(crate) struct FlowQueue {
    head: *mut FlowNode,
    tail: *mut FlowNode,
    len: usize,
}

impl FlowQueue {
    pub fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> *mut FlowNode {
        self.head
    }

    pub fn tail(&self) -> *mut FlowNode {
        self.tail
    }

    // SAFTY: node must come from FlowNode::alloc and not be linked anywhere
    pub unsafe fn push_front(&mut self, node: *mut FlowNode) {
        let ref_node = &mut *node;
        ref_node.prev = ptr::null_mut();
        ref_node.next = self.head;
        if self.head.is_null() {
            self.tail = node;
        } else {
            (*self.head).prev = node;
        }
        self.head = node;
        self.len += 1;
    }

    // SAFTY: node must come from FlowNode::alloc and not be linked anywhere
    pub unsafe fn push_back(&mut self, node: *mut FlowNode) {
        let ref_node = &mut *node;
        ref_node.next = ptr::null_mut();
        ref_node.prev = self.tail;
        if self.tail.is_null() {
            self.head = node;
        } else {
            (*self.tail).next = node;
        }
        self.tail = node;
        self.len += 1;
    }

    // SAFTY: node must be linked in this queue
    pub unsafe fn unlink(&mut self, node: *mut FlowNode) {
        let ref_node = &mut *node;
        if ref_node.prev.is_null() {
            debug_assert_eq!(self.head, node);
            self.head = ref_node.next;
        } else {
            (*ref_node.prev).next = ref_node.next;
        }
        if ref_node.next.is_null() {
            debug_assert_eq!(self.tail, node);
            self.tail = ref_node.prev;
        } else {
            (*ref_node.next).prev = ref_node.prev;
        }
        ref_node.prev = ptr::null_mut();
        ref_node.next = ptr::null_mut();
        self.len -= 1;
    }

    /// Detaches and returns the head, or null when empty. The caller takes
    /// ownership of the returned node.
    pub unsafe fn pop_front(&mut self) -> *mut FlowNode {
        let node = self.head;
        if !node.is_null() {
            self.unlink(node);
        }
        node
    }

    // SAFTY: node must be linked in this queue
    pub unsafe fn move_to_front(&mut self, node: *mut FlowNode) {
        if self.head == node {
            return;
        }
        self.unlink(node);
        self.push_front(node);
    }

    /// Re-places a linked node whose `end_time` just changed so the queue
    /// stays non-increasing. Touched records only ever move toward the head,
    /// so the walk is short for packets that are nearly in order.
    ///
    /// SAFTY: node must be linked in this queue
    pub unsafe fn restore_order(&mut self, node: *mut FlowNode) {
        let time = (*node).flow.end_time;
        if !(*node).prev.is_null() && (*(*node).prev).flow.end_time < time {
            let mut at = (*node).prev;
            while !(*at).prev.is_null() && (*(*at).prev).flow.end_time < time {
                at = (*at).prev;
            }
            self.unlink(node);
            self.insert_before(at, node);
        } else if !(*node).next.is_null() && (*(*node).next).flow.end_time > time {
            let mut at = (*node).next;
            while !(*at).next.is_null() && (*(*at).next).flow.end_time > time {
                at = (*at).next;
            }
            self.unlink(node);
            self.insert_after(at, node);
        }
    }

    /// Links a new node at its ordered position, scanning from the head.
    /// Only needed for records created by late packets, which land close to
    /// the head anyway.
    ///
    /// SAFTY: node must come from FlowNode::alloc and not be linked anywhere
    pub unsafe fn insert_by_time(&mut self, node: *mut FlowNode) {
        let time = (*node).flow.end_time;
        let mut at = self.head;
        while !at.is_null() && (*at).flow.end_time > time {
            at = (*at).next;
        }
        if at.is_null() {
            self.push_back(node);
        } else {
            self.insert_before(at, node);
        }
    }

    // SAFTY: at must be linked in this queue, node must be unlinked
    unsafe fn insert_before(&mut self, at: *mut FlowNode, node: *mut FlowNode) {
        let ref_at = &mut *at;
        let ref_node = &mut *node;
        ref_node.prev = ref_at.prev;
        ref_node.next = at;
        if ref_at.prev.is_null() {
            self.head = node;
        } else {
            (*ref_at.prev).next = node;
        }
        ref_at.prev = node;
        self.len += 1;
    }

    // SAFTY: at must be linked in this queue, node must be unlinked
    unsafe fn insert_after(&mut self, at: *mut FlowNode, node: *mut FlowNode) {
        let ref_at = &mut *at;
        let ref_node = &mut *node;
        ref_node.next = ref_at.next;
        ref_node.prev = at;
        if ref_at.next.is_null() {
            self.tail = node;
        } else {
            (*ref_at.next).prev = node;
        }
        ref_at.next = node;
        self.len += 1;
    }

    /// Checks the chain is consistent and `end_time` never increases from
    /// head to tail. Used in debug assertions and tests.
    pub unsafe fn is_time_ordered(&self) -> bool {
        let mut count = 0;
        let mut prev: *mut FlowNode = ptr::null_mut();
        let mut node = self.head;
        while !node.is_null() {
            if (*node).prev != prev {
                return false;
            }
            if !prev.is_null() && (*prev).flow.end_time < (*node).flow.end_time {
                return false;
            }
            count += 1;
            prev = node;
            node = (*node).next;
        }
        prev == self.tail && count == self.len
    }
}

impl Drop for FlowQueue {
    fn drop(&mut self) {
        // SAFTY:
        // - The nodes are allocated with Box::into_raw
        // - Each node is linked in at most one queue
        unsafe {
            let mut node = self.head;
            while !node.is_null() {
                let next = (*node).next;
                let _ = FlowNode::free(node);
                node = next;
            }
        }
        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
        self.len = 0;
    }
}

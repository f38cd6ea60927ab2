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
use std::ptr;
use std::rc::Rc;

use super::partition::LabelPartition;
use crate::common::flow::Flow;

/// One cache-resident flow record plus its intrusive queue linkage.
///
/// Nodes are allocated with `Box::into_raw` and freed with `Box::from_raw`.
/// While a record is active its node is reachable from exactly one index
/// entry and sits in the active queue; once closed it leaves the index and
/// sits in the closed queue until drained.
pub(crate) struct FlowNode {
    pub flow: Box<Flow>,

    // queue chain
    pub prev: *mut FlowNode,
    pub next: *mut FlowNode,

    /// Holds the record's MPLS partition alive for as long as the record is.
    pub partition: Option<Rc<RefCell<LabelPartition>>>,
}

impl FlowNode {
    pub fn alloc(flow: Flow) -> *mut FlowNode {
        Box::into_raw(Box::new(FlowNode {
            flow: Box::new(flow),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            partition: None,
        }))
    }

    // SAFTY: node must come from FlowNode::alloc, be unlinked and not freed twice
    pub unsafe fn free(node: *mut FlowNode) -> Box<FlowNode> {
        Box::from_raw(node)
    }
}

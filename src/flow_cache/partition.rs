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
use std::rc::Rc;

use ahash::AHashMap;
use log::debug;

use super::node::FlowNode;
use crate::common::flow::FlowKey;
use crate::common::meta_packet::LabelStack;

/// Private flow index for one MPLS label stack.
///
/// When label partitioning is on, records carrying different top labels must
/// never collide, so each stack gets its own index instead of the shared
/// one. The table entry and every live record under it share ownership via
/// `Rc`; the strong count is therefore one plus the number of records.
pub(crate) struct LabelPartition {
    pub stack: LabelStack,
    pub index: AHashMap<FlowKey, *mut FlowNode>,
}

pub(crate) struct PartitionTable {
    partitions: AHashMap<LabelStack, Rc<RefCell<LabelPartition>>>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self {
            partitions: AHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn contains(&self, stack: &LabelStack) -> bool {
        self.partitions.contains_key(stack)
    }

    pub fn get_or_create(&mut self, stack: LabelStack) -> Rc<RefCell<LabelPartition>> {
        self.partitions
            .entry(stack)
            .or_insert_with(|| {
                debug!("new label partition [{}]", stack);
                Rc::new(RefCell::new(LabelPartition {
                    stack,
                    index: AHashMap::new(),
                }))
            })
            .clone()
    }

    /// Gives back one record's reference. When only the table's own
    /// reference remains afterwards, the partition is torn down on the spot.
    pub fn release(&mut self, partition: Rc<RefCell<LabelPartition>>) {
        let stack = partition.borrow().stack;
        drop(partition);
        if let Some(p) = self.partitions.get(&stack) {
            if Rc::strong_count(p) == 1 {
                debug_assert!(p.borrow().index.is_empty());
                debug!("label partition [{}] destroyed", stack);
                self.partitions.remove(&stack);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_release_destroys_partition() {
        let mut table = PartitionTable::new();
        let stack = LabelStack::new(&[100, 200]);

        let a = table.get_or_create(stack);
        let b = table.get_or_create(stack);
        assert_eq!(table.len(), 1);
        assert!(Rc::ptr_eq(&a, &b));

        table.release(a);
        assert!(table.contains(&stack));

        table.release(b);
        assert!(!table.contains(&stack));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn distinct_stacks_get_distinct_partitions() {
        let mut table = PartitionTable::new();
        let a = table.get_or_create(LabelStack::new(&[1]));
        let b = table.get_or_create(LabelStack::new(&[2]));
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 2);
        table.release(a);
        table.release(b);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn recreated_stack_is_a_fresh_partition() {
        let mut table = PartitionTable::new();
        let stack = LabelStack::new(&[7, 8, 9]);
        let a = table.get_or_create(stack);
        table.release(a);
        assert!(!table.contains(&stack));
        let b = table.get_or_create(stack);
        assert!(table.contains(&stack));
        table.release(b);
    }
}

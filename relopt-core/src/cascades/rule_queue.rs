// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet, VecDeque};

use super::optimizer::{ExprId, RuleId};

/// The order in which pending rule matches fire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuleMatchOrder {
    /// In discovery order.
    #[default]
    Fifo,
    /// Higher rule priority first, discovery order among equals.
    Priority,
}

/// A rule together with a concrete binding of its operands, in pre-order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleMatch {
    pub rule_id: RuleId,
    pub exprs: Vec<ExprId>,
}

#[derive(PartialEq, Eq)]
struct PrioritizedMatch {
    priority: i32,
    seq: Reverse<u64>,
    rule_match: RuleMatch,
}

impl Ord for PrioritizedMatch {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for PrioritizedMatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending rule matches. A match is accepted at most once for the lifetime of the queue, so a
/// rule never fires twice on the same binding.
pub(crate) struct RuleMatchQueue {
    order: RuleMatchOrder,
    fifo: VecDeque<RuleMatch>,
    heap: BinaryHeap<PrioritizedMatch>,
    seen: HashSet<RuleMatch>,
    seq: u64,
}

impl RuleMatchQueue {
    pub fn new(order: RuleMatchOrder) -> Self {
        Self {
            order,
            fifo: VecDeque::new(),
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
            seq: 0,
        }
    }

    /// Enqueues the match unless it was seen before. Returns whether it was enqueued.
    pub fn push(&mut self, rule_match: RuleMatch, priority: i32) -> bool {
        if !self.seen.insert(rule_match.clone()) {
            return false;
        }
        self.seq += 1;
        match self.order {
            RuleMatchOrder::Fifo => self.fifo.push_back(rule_match),
            RuleMatchOrder::Priority => self.heap.push(PrioritizedMatch {
                priority,
                seq: Reverse(self.seq),
                rule_match,
            }),
        }
        true
    }

    pub fn pop(&mut self) -> Option<RuleMatch> {
        match self.order {
            RuleMatchOrder::Fifo => self.fifo.pop_front(),
            RuleMatchOrder::Priority => self.heap.pop().map(|x| x.rule_match),
        }
    }

    /// Lets the match be enqueued again later.
    pub fn forget(&mut self, rule_match: &RuleMatch) {
        self.seen.remove(rule_match);
    }

    pub fn len(&self) -> usize {
        self.fifo.len() + self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

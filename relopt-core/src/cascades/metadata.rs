// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use super::memo::Memo;
use super::optimizer::GroupId;
use crate::cost::CostModel;
use crate::nodes::NodeType;

/// Row counts memoized for the duration of one search. Dropped whenever groups merge.
#[derive(Default, Debug)]
pub struct MetadataCache {
    row_counts: HashMap<GroupId, f64>,
}

impl MetadataCache {
    pub fn clear(&mut self) {
        self.row_counts.clear();
    }

    pub fn len(&self) -> usize {
        self.row_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_counts.is_empty()
    }
}

/// Metadata access handed to the cost model. Tracks which groups are being computed so a
/// self-referential query, such as a group whose member reads from the group itself, answers
/// "unknown" instead of recursing forever.
pub struct MetadataQuery<'a, T: NodeType> {
    memo: &'a Memo<T>,
    model: &'a dyn CostModel<T>,
    cache: &'a mut MetadataCache,
    in_progress: HashSet<GroupId>,
    cycle_hit: bool,
}

impl<'a, T: NodeType> MetadataQuery<'a, T> {
    pub fn new(memo: &'a Memo<T>, model: &'a dyn CostModel<T>, cache: &'a mut MetadataCache) -> Self {
        Self {
            memo,
            model,
            cache,
            in_progress: HashSet::new(),
            cycle_hit: false,
        }
    }

    pub fn memo(&self) -> &Memo<T> {
        self.memo
    }

    /// Estimated output rows of a group: the smallest estimate among its members, or `None` if no
    /// member knows.
    pub fn row_count(&mut self, group_id: GroupId) -> Option<f64> {
        let group_id = self.memo.reduce_group(group_id);
        if let Some(rows) = self.cache.row_counts.get(&group_id) {
            return Some(*rows);
        }
        if !self.in_progress.insert(group_id) {
            trace!(event = "metadata_cycle", group_id = %group_id);
            self.cycle_hit = true;
            return None;
        }
        let outer_cycle_hit = std::mem::replace(&mut self.cycle_hit, false);
        let mut best: Option<f64> = None;
        for expr_id in self.memo.get_all_exprs_in_group(group_id) {
            let node = self.memo.get_expr_memoed(expr_id);
            let model = self.model;
            if let Some(rows) = model.estimated_row_count(&node, self) {
                if !rows.is_nan() {
                    best = Some(best.map_or(rows, |b| b.min(rows)));
                }
            }
        }
        self.in_progress.remove(&group_id);
        // An answer cut short by a cycle is not cached.
        if let (Some(rows), false) = (best, self.cycle_hit) {
            self.cache.row_counts.insert(group_id, rows);
        }
        self.cycle_hit |= outer_cycle_hit;
        best
    }
}

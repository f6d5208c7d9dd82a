// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

mod ir;

pub use ir::RuleMatcher;

use crate::nodes::{ArcPlanNode, NodeType, PlanNodeOrGroup};
use crate::optimizer::Optimizer;

/// A rule can be two kind:
/// 1. transformation rule fired to expand expression, generating new logical multi-expressions
/// 2. implementation rule fired to generating corresponding physical multi-expressions.
///
/// `apply` receives the binding as a plan node tree: every operand of the matcher that
/// constrains a node kind appears as a materialized node, and every wildcard appears as a
/// [`PlanNodeOrGroup::Group`] placeholder. Each returned item is equivalent to the binding
/// root. A returned `Group` declares the root's group equivalent to that group.
pub trait Rule<T: NodeType, O: Optimizer<T>>: 'static + Send + Sync {
    fn matcher(&self) -> &RuleMatcher<T>;
    fn apply(&self, optimizer: &O, binding: ArcPlanNode<T>) -> Vec<PlanNodeOrGroup<T>>;
    fn name(&self) -> &'static str;
    fn is_impl_rule(&self) -> bool {
        false
    }
    /// Only consulted when matches are popped by priority. Higher fires first.
    fn priority(&self) -> i32 {
        0
    }
}

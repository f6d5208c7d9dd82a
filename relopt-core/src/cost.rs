// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::cascades::{MemoPlanNode, MetadataQuery, RelNodeContext};
use crate::nodes::NodeType;

/// A cost vector. What each dimension means is up to the cost model; the search only ever
/// compares costs through [`CostModel::weighted_cost`].
#[derive(Default, Clone, Debug, PartialOrd, PartialEq, serde::Serialize)]
pub struct Cost(pub Vec<f64>);

impl Cost {
    pub fn infinite() -> Self {
        Cost(vec![f64::INFINITY])
    }
}

pub trait CostModel<T: NodeType>: 'static + Send + Sync {
    /// Cost of the operation alone, excluding its inputs. Only called on physical nodes.
    fn compute_operation_cost(
        &self,
        node: &MemoPlanNode<T>,
        children_costs: &[Cost],
        context: &RelNodeContext,
        metadata: &mut MetadataQuery<'_, T>,
    ) -> Cost;

    /// Estimated output rows of a node, or `None` if unknown. Children row counts can be
    /// obtained through `metadata`.
    fn estimated_row_count(
        &self,
        node: &MemoPlanNode<T>,
        metadata: &mut MetadataQuery<'_, T>,
    ) -> Option<f64>;

    /// The scalar used to order costs.
    fn weighted_cost(&self, cost: &Cost) -> f64;

    fn explain_cost(&self, cost: &Cost) -> String;

    fn accumulate(&self, total_cost: &mut Cost, cost: &Cost);

    fn sum(&self, operation_cost: &Cost, inputs_cost: &[Cost]) -> Cost {
        let mut total_cost = operation_cost.clone();
        for input in inputs_cost {
            self.accumulate(&mut total_cost, input);
        }
        total_cost
    }

    fn zero(&self) -> Cost;
}

/// Weighted cost with unknown values (`NaN`) treated as unbounded.
pub(crate) fn normalized_weighted_cost<T: NodeType>(model: &dyn CostModel<T>, cost: &Cost) -> f64 {
    let weighted = model.weighted_cost(cost);
    if weighted.is_nan() {
        f64::INFINITY
    } else {
        weighted
    }
}

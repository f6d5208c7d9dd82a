// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use anyhow::Result;

use crate::cascades::GroupId;
use crate::logical_property::LogicalPropertyBuilder;
use crate::nodes::{ArcPlanNode, NodeType};
use crate::physical_property::{PhysicalPropertyRegistry, PhysicalPropertySet};

pub trait Optimizer<T: NodeType> {
    fn optimize(&mut self, root_rel: ArcPlanNode<T>) -> Result<ArcPlanNode<T>>;

    fn optimize_with_required_props(
        &mut self,
        root_rel: ArcPlanNode<T>,
        required_props: &PhysicalPropertySet,
    ) -> Result<ArcPlanNode<T>>;

    /// The logical property at index `idx` of the group. Fails if the group does not exist or
    /// the property at `idx` is not a `P::Prop`.
    fn get_property<P: LogicalPropertyBuilder<T>>(&self, group_id: GroupId, idx: usize)
        -> Result<P::Prop>;

    fn physical_property_registry(&self) -> &PhysicalPropertyRegistry<T>;
}

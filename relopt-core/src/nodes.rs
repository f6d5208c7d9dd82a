// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The RelNode is the basic data structure of the optimizer. It is dynamically typed and is
//! the internal representation of a plan node, both on the way into the memo and on the way
//! out of it.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use itertools::Itertools;
use ordered_float::OrderedFloat;

use crate::cascades::GroupId;
use crate::physical_property::PhysicalPropertySet;

/// The row type carried by every plan node. All members of a group share one row type.
pub type RowType = SchemaRef;

pub type ArcPlanNode<T> = Arc<PlanNode<T>>;

/// The operator kind of a plan node. Usually a plain enum owned by the host of the optimizer.
pub trait NodeType:
    PartialEq + Eq + Hash + Clone + 'static + Display + Debug + Send + Sync
{
    /// Logical nodes are only used for exploration. They never become a winner of a sub group
    /// and are never passed to the cost model.
    fn is_logical(&self) -> bool;
}

/// Operator-specific parameters of a plan node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    UInt64(u64),
    Int64(i64),
    Float(OrderedFloat<f64>),
    String(Arc<str>),
    Bool(bool),
    List(Arc<[Value]>),
    Serialized(Arc<[u8]>),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UInt64(x) => write!(f, "{x}(u64)"),
            Self::Int64(x) => write!(f, "{x}(i64)"),
            Self::Float(x) => write!(f, "{x}(float)"),
            Self::String(x) => write!(f, "\"{x}\""),
            Self::Bool(x) => write!(f, "{x}"),
            Self::List(x) => write!(f, "[{}]", x.iter().join(", ")),
            Self::Serialized(x) => write!(f, "<len:{}>", x.len()),
        }
    }
}

impl Value {
    pub fn as_u64(&self) -> u64 {
        match self {
            Value::UInt64(i) => *i,
            _ => panic!("Value is not an u64"),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int64(i) => *i,
            _ => panic!("Value is not an i64"),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Float(i) => **i,
            _ => panic!("Value is not an f64"),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(i) => *i,
            _ => panic!("Value is not a bool"),
        }
    }

    pub fn as_str(&self) -> Arc<str> {
        match self {
            Value::String(i) => i.clone(),
            _ => panic!("Value is not a string"),
        }
    }

    pub fn as_slice(&self) -> Arc<[Value]> {
        match self {
            Value::List(i) => i.clone(),
            _ => panic!("Value is not a list"),
        }
    }
}

/// A reference to a sub group: a group narrowed to the physical properties the referencing
/// parent requires from it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubGroupRef {
    pub group_id: GroupId,
    pub props: PhysicalPropertySet,
}

impl SubGroupRef {
    pub fn new(group_id: GroupId, props: PhysicalPropertySet) -> Self {
        Self { group_id, props }
    }
}

impl Display for SubGroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.group_id, self.props)
    }
}

/// A child of a plan node: either a materialized node or a placeholder for a sub group that is
/// already in the memo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanNodeOrGroup<T: NodeType> {
    PlanNode(ArcPlanNode<T>),
    Group(SubGroupRef),
}

impl<T: NodeType> PlanNodeOrGroup<T> {
    pub fn is_materialized(&self) -> bool {
        matches!(self, PlanNodeOrGroup::PlanNode(_))
    }

    pub fn unwrap_typ(&self) -> T {
        self.unwrap_plan_node().typ.clone()
    }

    pub fn unwrap_plan_node(&self) -> ArcPlanNode<T> {
        match self {
            PlanNodeOrGroup::PlanNode(node) => node.clone(),
            PlanNodeOrGroup::Group(_) => panic!("Expected PlanNode, found Group"),
        }
    }

    pub fn unwrap_group(&self) -> SubGroupRef {
        match self {
            PlanNodeOrGroup::PlanNode(_) => panic!("Expected Group, found PlanNode"),
            PlanNodeOrGroup::Group(group) => group.clone(),
        }
    }

    /// The physical properties this child is required to provide.
    pub fn required_props(&self) -> &PhysicalPropertySet {
        match self {
            PlanNodeOrGroup::PlanNode(node) => &node.props,
            PlanNodeOrGroup::Group(group) => &group.props,
        }
    }
}

impl<T: NodeType> From<ArcPlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(value: ArcPlanNode<T>) -> Self {
        PlanNodeOrGroup::PlanNode(value)
    }
}

impl<T: NodeType> From<PlanNode<T>> for PlanNodeOrGroup<T> {
    fn from(value: PlanNode<T>) -> Self {
        PlanNodeOrGroup::PlanNode(Arc::new(value))
    }
}

impl<T: NodeType> From<SubGroupRef> for PlanNodeOrGroup<T> {
    fn from(value: SubGroupRef) -> Self {
        PlanNodeOrGroup::Group(value)
    }
}

impl<T: NodeType> Display for PlanNodeOrGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanNodeOrGroup::PlanNode(node) => write!(f, "{}", node),
            PlanNodeOrGroup::Group(group) => write!(f, "{}", group),
        }
    }
}

/// A plan node: operator kind, parameters, inputs, row type and the physical properties the
/// node delivers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlanNode<T: NodeType> {
    pub typ: T,
    pub children: Vec<PlanNodeOrGroup<T>>,
    pub data: Option<Value>,
    pub row_type: RowType,
    pub props: PhysicalPropertySet,
}

impl<T: NodeType> PlanNode<T> {
    pub fn child(&self, idx: usize) -> PlanNodeOrGroup<T> {
        self.children[idx].clone()
    }

    pub fn child_rel(&self, idx: usize) -> ArcPlanNode<T> {
        self.child(idx).unwrap_plan_node()
    }

    /// Returns a copy of this node with the given children, keeping everything else.
    pub fn with_children(&self, children: Vec<PlanNodeOrGroup<T>>) -> Self {
        Self {
            typ: self.typ.clone(),
            children,
            data: self.data.clone(),
            row_type: self.row_type.clone(),
            props: self.props.clone(),
        }
    }

    /// Returns a copy of this node with another operator kind and delivered properties.
    pub fn with_typ(&self, typ: T, props: PhysicalPropertySet) -> Self {
        Self {
            typ,
            children: self.children.clone(),
            data: self.data.clone(),
            row_type: self.row_type.clone(),
            props,
        }
    }

    /// Number of nodes in the materialized part of the tree.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|child| match child {
                PlanNodeOrGroup::PlanNode(node) => node.node_count(),
                PlanNodeOrGroup::Group(_) => 0,
            })
            .sum::<usize>()
    }
}

impl<T: NodeType> Display for PlanNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.typ)?;
        if let Some(data) = &self.data {
            write!(f, " {}", data)?;
        }
        for child in &self.children {
            write!(f, " {}", child)?;
        }
        write!(f, ")")
    }
}

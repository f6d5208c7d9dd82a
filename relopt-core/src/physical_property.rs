// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Physical properties ("traits") of a plan: calling convention, collation and distribution,
//! plus an escape hatch for kinds registered by the host.
//!
//! A [`PhysicalPropertySet`] carries one value per registered kind, positionally aligned with
//! the builders of the [`PhysicalPropertyRegistry`]. Each builder knows whether a delivered
//! value satisfies a required one and how to synthesize an enforcer node converting between
//! them.

mod collation;
mod convention;
mod distribution;

use std::fmt::Display;
use std::sync::Arc;

use itertools::Itertools;
use tracing::trace;

pub use collation::{Collation, CollationPropertyBuilder, SortDirection, SortKey};
pub use convention::{Convention, ConventionPropertyBuilder};
pub use distribution::{Distribution, DistributionPropertyBuilder};

use crate::error::OptimizerError;
use crate::nodes::{NodeType, PlanNode, RowType, SubGroupRef, Value};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PhysicalProperty {
    Convention(Convention),
    Collation(Collation),
    Distribution(Distribution),
    Custom(Value),
}

impl Display for PhysicalProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Convention(x) => write!(f, "{x}"),
            Self::Collation(x) => write!(f, "{x}"),
            Self::Distribution(x) => write!(f, "{x}"),
            Self::Custom(x) => write!(f, "custom({x})"),
        }
    }
}

/// One value per registered property kind, in registry order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalPropertySet(Arc<[PhysicalProperty]>);

// Properties only need a stable order for deterministic iteration, so compare their rendering.
impl PartialOrd for PhysicalProperty {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PhysicalProperty {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PhysicalPropertySet {
    pub fn new(props: Vec<PhysicalProperty>) -> Self {
        Self(props.into())
    }

    pub fn empty() -> Self {
        Self(Arc::new([]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> &PhysicalProperty {
        &self.0[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhysicalProperty> {
        self.0.iter()
    }

    /// Returns a copy of the set with the value at `idx` replaced.
    pub fn replace(&self, idx: usize, prop: PhysicalProperty) -> Self {
        let mut props = self.0.to_vec();
        props[idx] = prop;
        Self::new(props)
    }
}

impl Display for PhysicalPropertySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.iter().join(", "))
    }
}

/// Everything a builder needs to synthesize an enforcer for one property kind.
pub struct EnforceRequest<'a> {
    /// The sub group the enforcer reads from.
    pub input: &'a SubGroupRef,
    pub row_type: &'a RowType,
    /// The full property set the enforcer delivers.
    pub output_props: &'a PhysicalPropertySet,
    pub actual: &'a PhysicalProperty,
    pub required: &'a PhysicalProperty,
}

/// Describes one physical property kind.
pub trait PhysicalPropertyBuilder<T: NodeType>: 'static + Send + Sync {
    fn property_name(&self) -> &'static str;

    /// The value that places no requirement on a plan.
    fn any(&self) -> PhysicalProperty;

    /// Whether `prop` is a value of this kind. Sets holding a foreign value in this builder's
    /// position are rejected before they reach `satisfies` or `enforce`.
    fn accepts(&self, prop: &PhysicalProperty) -> bool;

    /// Checks whether the delivered value meets the requirement. For collation, a plan sorted
    /// by `(a, b)` satisfies a requirement of `(a)`.
    fn satisfies(&self, actual: &PhysicalProperty, required: &PhysicalProperty) -> bool;

    /// Builds a node converting `request.actual` into `request.required`, or `None` if no legal
    /// conversion exists.
    fn enforce(&self, request: EnforceRequest<'_>) -> Option<PlanNode<T>>;
}

/// The capability table of all registered property kinds.
pub struct PhysicalPropertyRegistry<T: NodeType> {
    builders: Vec<Box<dyn PhysicalPropertyBuilder<T>>>,
}

impl<T: NodeType> PhysicalPropertyRegistry<T> {
    pub fn new(builders: Vec<Box<dyn PhysicalPropertyBuilder<T>>>) -> Self {
        Self { builders }
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn property_names(&self) -> Vec<&'static str> {
        self.builders.iter().map(|b| b.property_name()).collect()
    }

    /// The property set with no requirements.
    pub fn any(&self) -> PhysicalPropertySet {
        PhysicalPropertySet::new(self.builders.iter().map(|b| b.any()).collect())
    }

    /// Validates that `props` has one value per registered kind, each in its builder's position.
    pub fn check_arity(&self, props: &PhysicalPropertySet) -> Result<(), OptimizerError> {
        if props.len() != self.builders.len() {
            return Err(OptimizerError::PropertyArity {
                props: props.clone(),
                expected: self.builders.len(),
                actual: props.len(),
            });
        }
        match self
            .builders
            .iter()
            .zip(props.iter())
            .position(|(builder, prop)| !builder.accepts(prop))
        {
            Some(position) => Err(OptimizerError::PropertyKind {
                props: props.clone(),
                position,
                expected: self.builders[position].property_name(),
            }),
            None => Ok(()),
        }
    }

    pub fn satisfies(&self, actual: &PhysicalPropertySet, required: &PhysicalPropertySet) -> bool {
        if actual.len() != required.len() || actual.len() != self.builders.len() {
            return false;
        }
        self.builders
            .iter()
            .zip(actual.iter().zip(required.iter()))
            .all(|(builder, (actual, required))| builder.satisfies(actual, required))
    }

    /// Synthesizes a chain of enforcers turning the output of `input` (delivering `actual`)
    /// into a plan delivering `required`. Every unsatisfied kind contributes one node, reading
    /// from the sub group produced by the previous node. Returns `None` if some kind cannot be
    /// converted, or if nothing needs converting.
    pub fn convert(
        &self,
        input: &SubGroupRef,
        row_type: &RowType,
        actual: &PhysicalPropertySet,
        required: &PhysicalPropertySet,
    ) -> Option<Vec<PlanNode<T>>> {
        let mut chain = Vec::new();
        let mut current_input = input.clone();
        let mut current = actual.clone();
        for (idx, builder) in self.builders.iter().enumerate() {
            if builder.satisfies(current.get(idx), required.get(idx)) {
                continue;
            }
            let output_props = current.replace(idx, required.get(idx).clone());
            let Some(node) = builder.enforce(EnforceRequest {
                input: &current_input,
                row_type,
                output_props: &output_props,
                actual: current.get(idx),
                required: required.get(idx),
            }) else {
                trace!(
                    event = "enforce_refused",
                    property = builder.property_name(),
                    actual = %current.get(idx),
                    required = %required.get(idx),
                );
                return None;
            };
            debug_assert_eq!(node.props, output_props);
            chain.push(node);
            current_input = SubGroupRef::new(input.group_id, output_props.clone());
            current = output_props;
        }
        if chain.is_empty() {
            None
        } else {
            Some(chain)
        }
    }
}

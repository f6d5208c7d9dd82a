// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::fmt::Display;

use itertools::Itertools;

use super::{EnforceRequest, PhysicalProperty, PhysicalPropertyBuilder};
use crate::nodes::{NodeType, PlanNode, PlanNodeOrGroup, Value};

/// How the rows of a plan are spread across workers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Distribution {
    Any,
    Singleton,
    Broadcast,
    RoundRobin,
    Hash(Vec<usize>),
}

impl Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "dist:any"),
            Self::Singleton => write!(f, "dist:singleton"),
            Self::Broadcast => write!(f, "dist:broadcast"),
            Self::RoundRobin => write!(f, "dist:round_robin"),
            Self::Hash(keys) => write!(f, "dist:hash({})", keys.iter().join(", ")),
        }
    }
}

impl Distribution {
    /// Encodes the distribution as the `data` of an exchange node.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Any => Value::String("any".into()),
            Self::Singleton => Value::String("singleton".into()),
            Self::Broadcast => Value::String("broadcast".into()),
            Self::RoundRobin => Value::String("round_robin".into()),
            Self::Hash(keys) => Value::List(keys.iter().map(|k| Value::UInt64(*k as u64)).collect()),
        }
    }

    /// Decodes the `data` of an exchange node.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::List(keys) => keys
                .iter()
                .map(|key| match key {
                    Value::UInt64(column) => usize::try_from(*column).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::Hash),
            Value::String(name) => match name.as_ref() {
                "any" => Some(Self::Any),
                "singleton" => Some(Self::Singleton),
                "broadcast" => Some(Self::Broadcast),
                "round_robin" => Some(Self::RoundRobin),
                _ => None,
            },
            _ => None,
        }
    }
}

pub struct DistributionPropertyBuilder<T: NodeType> {
    exchange_typ: Option<T>,
}

impl<T: NodeType> DistributionPropertyBuilder<T> {
    pub fn new(exchange_typ: Option<T>) -> Self {
        Self { exchange_typ }
    }
}

impl<T: NodeType> PhysicalPropertyBuilder<T> for DistributionPropertyBuilder<T> {
    fn property_name(&self) -> &'static str {
        "distribution"
    }

    fn any(&self) -> PhysicalProperty {
        PhysicalProperty::Distribution(Distribution::Any)
    }

    fn accepts(&self, prop: &PhysicalProperty) -> bool {
        matches!(prop, PhysicalProperty::Distribution(_))
    }

    fn satisfies(&self, actual: &PhysicalProperty, required: &PhysicalProperty) -> bool {
        let (PhysicalProperty::Distribution(actual), PhysicalProperty::Distribution(required)) =
            (actual, required)
        else {
            return false;
        };
        match required {
            Distribution::Any => true,
            // A single stream is trivially partitioned on any key.
            Distribution::Hash(_) if actual == &Distribution::Singleton => true,
            required => actual == required,
        }
    }

    fn enforce(&self, request: EnforceRequest<'_>) -> Option<PlanNode<T>> {
        let PhysicalProperty::Distribution(required) = request.required else {
            return None;
        };
        let exchange_typ = self.exchange_typ.clone()?;
        Some(PlanNode {
            typ: exchange_typ,
            children: vec![PlanNodeOrGroup::Group(request.input.clone())],
            data: Some(required.to_value()),
            row_type: request.row_type.clone(),
            props: request.output_props.clone(),
        })
    }
}

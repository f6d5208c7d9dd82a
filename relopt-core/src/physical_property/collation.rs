// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::fmt::Display;
use std::sync::Arc;

use itertools::Itertools;

use super::{EnforceRequest, PhysicalProperty, PhysicalPropertyBuilder};
use crate::nodes::{NodeType, PlanNode, PlanNodeOrGroup, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub column: usize,
    pub direction: SortDirection,
    pub nulls_first: bool,
}

impl Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dir = match self.direction {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        };
        write!(f, "#{} {}", self.column, dir)?;
        if self.nulls_first {
            write!(f, " nulls first")?;
        }
        Ok(())
    }
}

/// An ordering of the output rows. The empty collation places no requirement.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct Collation(pub Vec<SortKey>);

impl Display for Collation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "coll:any")
        } else {
            write!(f, "coll:[{}]", self.0.iter().join(", "))
        }
    }
}

impl Collation {
    /// Ascending, nulls last, on each of `columns`.
    pub fn asc(columns: Vec<usize>) -> Self {
        Self(
            columns
                .into_iter()
                .map(|column| SortKey {
                    column,
                    direction: SortDirection::Asc,
                    nulls_first: false,
                })
                .collect(),
        )
    }

    /// Encodes the keys as the `data` of a sort node: a list of `[column, desc, nulls_first]`.
    pub fn to_value(&self) -> Value {
        Value::List(
            self.0
                .iter()
                .map(|key| {
                    Value::List(Arc::new([
                        Value::UInt64(key.column as u64),
                        Value::Bool(key.direction == SortDirection::Desc),
                        Value::Bool(key.nulls_first),
                    ]))
                })
                .collect(),
        )
    }

    /// Decodes the `data` of a sort node. Returns `None` if it is not a list of well-formed keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        let Value::List(keys) = value else {
            return None;
        };
        keys.iter()
            .map(|key| match key {
                Value::List(fields) => match fields.as_ref() {
                    [Value::UInt64(column), Value::Bool(desc), Value::Bool(nulls_first)] => {
                        Some(SortKey {
                            column: usize::try_from(*column).ok()?,
                            direction: if *desc {
                                SortDirection::Desc
                            } else {
                                SortDirection::Asc
                            },
                            nulls_first: *nulls_first,
                        })
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }
}

pub struct CollationPropertyBuilder<T: NodeType> {
    sort_typ: Option<T>,
}

impl<T: NodeType> CollationPropertyBuilder<T> {
    /// `sort_typ` is the node kind inserted to sort a plan. Without one, a collation that is not
    /// delivered natively is unreachable.
    pub fn new(sort_typ: Option<T>) -> Self {
        Self { sort_typ }
    }
}

impl<T: NodeType> PhysicalPropertyBuilder<T> for CollationPropertyBuilder<T> {
    fn property_name(&self) -> &'static str {
        "collation"
    }

    fn any(&self) -> PhysicalProperty {
        PhysicalProperty::Collation(Collation::default())
    }

    fn accepts(&self, prop: &PhysicalProperty) -> bool {
        matches!(prop, PhysicalProperty::Collation(_))
    }

    fn satisfies(&self, actual: &PhysicalProperty, required: &PhysicalProperty) -> bool {
        match (actual, required) {
            (PhysicalProperty::Collation(actual), PhysicalProperty::Collation(required)) => {
                actual.0.starts_with(&required.0)
            }
            _ => false,
        }
    }

    fn enforce(&self, request: EnforceRequest<'_>) -> Option<PlanNode<T>> {
        let PhysicalProperty::Collation(required) = request.required else {
            return None;
        };
        let sort_typ = self.sort_typ.clone()?;
        Some(PlanNode {
            typ: sort_typ,
            children: vec![PlanNodeOrGroup::Group(request.input.clone())],
            data: Some(required.to_value()),
            row_type: request.row_type.clone(),
            props: request.output_props.clone(),
        })
    }
}

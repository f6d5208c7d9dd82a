// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::fmt::Display;
use std::sync::Arc;

use super::{EnforceRequest, PhysicalProperty, PhysicalPropertyBuilder};
use crate::nodes::{NodeType, PlanNode, PlanNodeOrGroup};

/// The calling convention of a plan, e.g. a row-based or a columnar engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Convention {
    /// No requirement.
    Any,
    /// Delivered by logical nodes. Nothing converts out of it.
    Logical,
    Named(Arc<str>),
}

impl Display for Convention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "conv:any"),
            Self::Logical => write!(f, "conv:logical"),
            Self::Named(name) => write!(f, "conv:{name}"),
        }
    }
}

impl Convention {
    pub fn named(name: &str) -> Self {
        Self::Named(name.into())
    }
}

/// A registered converter between two named conventions.
pub struct ConventionConverter<T: NodeType> {
    pub from: Arc<str>,
    pub to: Arc<str>,
    pub typ: T,
}

pub struct ConventionPropertyBuilder<T: NodeType> {
    converters: Vec<ConventionConverter<T>>,
}

impl<T: NodeType> ConventionPropertyBuilder<T> {
    pub fn new() -> Self {
        Self {
            converters: Vec::new(),
        }
    }

    /// Registers `typ` as the node kind converting plans of convention `from` into `to`.
    pub fn with_converter(mut self, from: &str, to: &str, typ: T) -> Self {
        self.converters.push(ConventionConverter {
            from: from.into(),
            to: to.into(),
            typ,
        });
        self
    }
}

impl<T: NodeType> PhysicalPropertyBuilder<T> for ConventionPropertyBuilder<T> {
    fn property_name(&self) -> &'static str {
        "convention"
    }

    fn any(&self) -> PhysicalProperty {
        PhysicalProperty::Convention(Convention::Any)
    }

    fn accepts(&self, prop: &PhysicalProperty) -> bool {
        matches!(prop, PhysicalProperty::Convention(_))
    }

    fn satisfies(&self, actual: &PhysicalProperty, required: &PhysicalProperty) -> bool {
        match (actual, required) {
            (_, PhysicalProperty::Convention(Convention::Any)) => true,
            (PhysicalProperty::Convention(actual), PhysicalProperty::Convention(required)) => {
                actual == required
            }
            _ => false,
        }
    }

    fn enforce(&self, request: EnforceRequest<'_>) -> Option<PlanNode<T>> {
        let (
            PhysicalProperty::Convention(Convention::Named(from)),
            PhysicalProperty::Convention(Convention::Named(to)),
        ) = (request.actual, request.required)
        else {
            return None;
        };
        let converter = self
            .converters
            .iter()
            .find(|c| &c.from == from && &c.to == to)?;
        Some(PlanNode {
            typ: converter.typ.clone(),
            children: vec![PlanNodeOrGroup::Group(request.input.clone())],
            data: None,
            row_type: request.row_type.clone(),
            props: request.output_props.clone(),
        })
    }
}

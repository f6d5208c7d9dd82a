// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Group-level facts such as the set of base tables below a group.
//!
//! A group's logical properties are computed when the group is created, from the node that
//! created it and from the already known properties of its input groups. They never change
//! afterwards, and all members of the group share them.

use std::any::{type_name, Any};
use std::fmt::Debug;

use crate::error::OptimizerError;
use crate::nodes::{NodeType, Value};

/// Object-safe form of [`LogicalPropertyBuilder`], used by the memo to store builders of
/// different property types side by side. Implemented for every `LogicalPropertyBuilder`.
pub trait LogicalPropertyBuilderAny<T: NodeType>: 'static + Send + Sync {
    /// `inputs[i]` is this builder's property of the i-th input group.
    fn derive_any(
        &self,
        typ: &T,
        data: Option<&Value>,
        inputs: &[&dyn Any],
    ) -> Result<Box<dyn Any + Send + Sync + 'static>, OptimizerError>;

    fn display(&self, prop: &dyn Any) -> String;

    fn property_name(&self) -> &'static str;
}

pub trait LogicalPropertyBuilder<T: NodeType>: 'static + Send + Sync + Sized {
    type Prop: 'static + Send + Sync + Sized + Clone + Debug;

    fn derive(&self, typ: &T, data: Option<&Value>, inputs: &[&Self::Prop]) -> Self::Prop;

    fn property_name(&self) -> &'static str;
}

fn typed<'a, T: NodeType, P: LogicalPropertyBuilder<T>>(
    builder: &P,
    prop: &'a dyn Any,
) -> Result<&'a P::Prop, OptimizerError> {
    prop.downcast_ref::<P::Prop>().ok_or_else(|| {
        OptimizerError::Internal(format!(
            "logical property {} is not a {}",
            <P as LogicalPropertyBuilder<T>>::property_name(builder),
            type_name::<P::Prop>()
        ))
    })
}

impl<T: NodeType, P: LogicalPropertyBuilder<T>> LogicalPropertyBuilderAny<T> for P {
    fn derive_any(
        &self,
        typ: &T,
        data: Option<&Value>,
        inputs: &[&dyn Any],
    ) -> Result<Box<dyn Any + Send + Sync + 'static>, OptimizerError> {
        let inputs = inputs
            .iter()
            .map(|input| typed::<T, P>(self, *input))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(self.derive(typ, data, &inputs)))
    }

    fn display(&self, prop: &dyn Any) -> String {
        match typed::<T, P>(self, prop) {
            Ok(prop) => format!("{prop:?}"),
            Err(_) => "<mistyped>".to_string(),
        }
    }

    fn property_name(&self) -> &'static str {
        LogicalPropertyBuilder::property_name(self)
    }
}

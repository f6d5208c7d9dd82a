// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use thiserror::Error;

use crate::cascades::GroupId;
use crate::physical_property::PhysicalPropertySet;

/// Failures surfaced by the optimizer core.
///
/// `RowTypeMismatch`, `InvalidRuleOutput`, `DanglingReference`, `PropertyArity`, `PropertyKind`
/// and `Internal` are invariant violations: they indicate a bug in a rule, a property builder or the memo and
/// abort the optimization call. `PlanNotFound` is an ordinary search outcome: no expression in
/// the memo can provide the requested physical properties.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    #[error("row type mismatch in group {group_id}: expected {expected}, got {actual}")]
    RowTypeMismatch {
        group_id: GroupId,
        expected: String,
        actual: String,
    },
    #[error("rule {rule} produced an invalid expression for binding {binding}: {reason}")]
    InvalidRuleOutput {
        rule: String,
        binding: String,
        reason: String,
    },
    #[error("reference to group {group_id} does not resolve to a live group ({context})")]
    DanglingReference { group_id: GroupId, context: String },
    #[error("no plan found for group {group_id} with required properties {props}")]
    PlanNotFound {
        group_id: GroupId,
        props: PhysicalPropertySet,
    },
    #[error("physical property set {props} has {actual} entries, but {expected} property kinds are registered")]
    PropertyArity {
        props: PhysicalPropertySet,
        expected: usize,
        actual: usize,
    },
    #[error("physical property set {props} has a value of the wrong kind at position {position}: expected {expected}")]
    PropertyKind {
        props: PhysicalPropertySet,
        position: usize,
        expected: &'static str,
    },
    #[error("internal optimizer error: {0}")]
    Internal(String),
}

impl OptimizerError {
    /// Returns true for errors that are a legitimate search dead-end rather than a bug.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PlanNotFound { .. })
    }
}

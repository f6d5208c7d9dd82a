// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Matching rule operand trees against the memo, and the index that decides which rules to try
//! when an expression is registered.

use std::collections::HashMap;
use std::mem::Discriminant;
use std::sync::Arc;

use itertools::Itertools;

use super::memo::Memo;
use super::optimizer::{ExprId, RuleId};
use crate::error::OptimizerError;
use crate::nodes::{ArcPlanNode, NodeType, PlanNode, PlanNodeOrGroup};
use crate::rules::RuleMatcher;

/// Enumerates all bindings of `matcher` rooted at `expr_id`. Each binding lists the bound
/// expressions in pre-order of the operand tree. A kind operand over a child group is tried
/// against every member of that group, so each combination of alternatives is its own binding.
pub(crate) fn match_and_pick_expr<T: NodeType>(
    matcher: &RuleMatcher<T>,
    expr_id: ExprId,
    memo: &Memo<T>,
) -> Vec<Vec<ExprId>> {
    let node = memo.get_expr_memoed(expr_id);
    if !matcher.accepts(&node.typ) {
        return vec![];
    }
    let operands = matcher.children();
    let arity_matches = match operands.last() {
        Some(RuleMatcher::AnyMany) => node.children.len() + 1 >= operands.len(),
        _ => node.children.len() == operands.len(),
    };
    if !arity_matches {
        return vec![];
    }
    let mut picks = vec![vec![expr_id]];
    for (idx, operand) in operands.iter().enumerate() {
        match operand {
            RuleMatcher::AnyMany => break,
            RuleMatcher::Any => continue,
            _ => {
                let child_group = node.children[idx].group_id;
                let alternatives = memo
                    .get_all_exprs_in_group(child_group)
                    .into_iter()
                    .flat_map(|child_expr| match_and_pick_expr(operand, child_expr, memo))
                    .collect_vec();
                if alternatives.is_empty() {
                    return vec![];
                }
                picks = picks
                    .into_iter()
                    .cartesian_product(alternatives)
                    .map(|(mut pick, alternative)| {
                        pick.extend(alternative);
                        pick
                    })
                    .collect();
            }
        }
    }
    picks
}

/// Materializes a binding produced by [`match_and_pick_expr`] into the plan node handed to the
/// rule.
pub(crate) fn binding_to_plan_node<T: NodeType>(
    matcher: &RuleMatcher<T>,
    exprs: &[ExprId],
    memo: &Memo<T>,
) -> Result<ArcPlanNode<T>, OptimizerError> {
    let mut cursor = 0;
    let node = build_binding(matcher, exprs, &mut cursor, memo)?;
    if cursor != exprs.len() {
        return Err(OptimizerError::Internal(format!(
            "binding [{}] is longer than its matcher {:?}",
            exprs.iter().join(", "),
            matcher
        )));
    }
    Ok(node)
}

fn build_binding<T: NodeType>(
    matcher: &RuleMatcher<T>,
    exprs: &[ExprId],
    cursor: &mut usize,
    memo: &Memo<T>,
) -> Result<ArcPlanNode<T>, OptimizerError> {
    let Some(&expr_id) = exprs.get(*cursor) else {
        return Err(OptimizerError::Internal(format!(
            "binding [{}] is shorter than its matcher {:?}",
            exprs.iter().join(", "),
            matcher
        )));
    };
    *cursor += 1;
    let node = memo.get_expr_memoed(expr_id);
    let group = memo.get_group(memo.get_group_id(expr_id))?;
    let operands = matcher.children();
    let mut children = Vec::with_capacity(node.children.len());
    for (idx, child) in node.children.iter().enumerate() {
        match operands.get(idx) {
            Some(operand) if !operand.is_wildcard() => {
                children.push(PlanNodeOrGroup::PlanNode(build_binding(
                    operand, exprs, cursor, memo,
                )?));
            }
            _ => children.push(PlanNodeOrGroup::Group(memo.reduce_sub_group_ref(child))),
        }
    }
    Ok(Arc::new(PlanNode {
        typ: node.typ.clone(),
        children,
        data: node.data.clone(),
        row_type: group.row_type().clone(),
        props: node.props.clone(),
    }))
}

/// Which rules could bind an expression of a given kind, and at which operand depth.
pub(crate) struct RuleIndex<T: NodeType> {
    by_typ: HashMap<T, Vec<(RuleId, usize)>>,
    by_discriminant: HashMap<Discriminant<T>, Vec<(RuleId, usize)>>,
    by_predicate: Vec<(RuleId, usize, fn(&T) -> bool)>,
}

impl<T: NodeType> RuleIndex<T> {
    pub fn new() -> Self {
        Self {
            by_typ: HashMap::new(),
            by_discriminant: HashMap::new(),
            by_predicate: Vec::new(),
        }
    }

    pub fn add_rule(&mut self, rule_id: RuleId, matcher: &RuleMatcher<T>) {
        for (depth, operand) in matcher.kind_operands() {
            match operand {
                RuleMatcher::MatchNode { typ, .. } => self
                    .by_typ
                    .entry(typ.clone())
                    .or_default()
                    .push((rule_id, depth)),
                RuleMatcher::MatchDiscriminant {
                    typ_discriminant, ..
                } => self
                    .by_discriminant
                    .entry(*typ_discriminant)
                    .or_default()
                    .push((rule_id, depth)),
                RuleMatcher::MatchPredicate { predicate, .. } => {
                    self.by_predicate.push((rule_id, depth, *predicate))
                }
                RuleMatcher::Any | RuleMatcher::AnyMany => {}
            }
        }
    }

    pub fn remove_rule(&mut self, rule_id: RuleId) {
        for entries in self.by_typ.values_mut() {
            entries.retain(|(id, _)| *id != rule_id);
        }
        for entries in self.by_discriminant.values_mut() {
            entries.retain(|(id, _)| *id != rule_id);
        }
        self.by_predicate.retain(|(id, _, _)| *id != rule_id);
    }

    /// `(rule, depth)` pairs whose operand at `depth` accepts `typ`, sorted and deduplicated.
    pub fn candidates(&self, typ: &T) -> Vec<(RuleId, usize)> {
        let mut candidates = Vec::new();
        if let Some(entries) = self.by_typ.get(typ) {
            candidates.extend(entries.iter().copied());
        }
        if let Some(entries) = self.by_discriminant.get(&std::mem::discriminant(typ)) {
            candidates.extend(entries.iter().copied());
        }
        candidates.extend(
            self.by_predicate
                .iter()
                .filter(|(_, _, predicate)| predicate(typ))
                .map(|(rule_id, depth, _)| (*rule_id, *depth)),
        );
        candidates.sort();
        candidates.dedup();
        candidates
    }
}

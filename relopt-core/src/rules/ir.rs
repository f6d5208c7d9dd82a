// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::mem::Discriminant;

use crate::nodes::NodeType;

/// An operand tree describing the shape of the expressions a rule applies to.
#[derive(Clone)]
pub enum RuleMatcher<T: NodeType> {
    /// Match a node of exactly type `typ`.
    MatchNode { typ: T, children: Vec<Self> },
    /// Match a node of the same enum variant as `typ_discriminant`, whatever its payload.
    MatchDiscriminant {
        typ_discriminant: Discriminant<T>,
        children: Vec<Self>,
    },
    /// Match a node whose type passes `predicate`.
    MatchPredicate {
        name: &'static str,
        predicate: fn(&T) -> bool,
        children: Vec<Self>,
    },
    /// Bind the child group without expanding it.
    Any,
    /// Bind all remaining children without expanding them. Must be the last child operand.
    AnyMany,
}

impl<T: NodeType> std::fmt::Debug for RuleMatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MatchNode { typ, children } => write!(f, "({typ} {children:?})"),
            Self::MatchDiscriminant {
                typ_discriminant,
                children,
            } => write!(f, "({typ_discriminant:?} {children:?})"),
            Self::MatchPredicate { name, children, .. } => write!(f, "(<{name}> {children:?})"),
            Self::Any => write!(f, "_"),
            Self::AnyMany => write!(f, ".."),
        }
    }
}

impl<T: NodeType> RuleMatcher<T> {
    /// Whether this operand accepts a node of kind `typ`. Wildcards accept everything.
    pub fn accepts(&self, typ: &T) -> bool {
        match self {
            Self::MatchNode { typ: expected, .. } => expected == typ,
            Self::MatchDiscriminant {
                typ_discriminant, ..
            } => *typ_discriminant == std::mem::discriminant(typ),
            Self::MatchPredicate { predicate, .. } => predicate(typ),
            Self::Any | Self::AnyMany => true,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Any | Self::AnyMany)
    }

    pub fn children(&self) -> &[Self] {
        match self {
            Self::MatchNode { children, .. }
            | Self::MatchDiscriminant { children, .. }
            | Self::MatchPredicate { children, .. } => children,
            Self::Any | Self::AnyMany => &[],
        }
    }

    /// All operands that constrain a node kind, with their depth below the root operand.
    pub fn kind_operands(&self) -> Vec<(usize, &Self)> {
        fn collect<'a, T: NodeType>(
            matcher: &'a RuleMatcher<T>,
            depth: usize,
            out: &mut Vec<(usize, &'a RuleMatcher<T>)>,
        ) {
            if matcher.is_wildcard() {
                return;
            }
            out.push((depth, matcher));
            for child in matcher.children() {
                collect(child, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        collect(self, 0, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tests::common::TestNodeType;

    #[test]
    fn kind_operands_report_depth() {
        let matcher = RuleMatcher::MatchNode {
            typ: TestNodeType::Join,
            children: vec![
                RuleMatcher::MatchNode {
                    typ: TestNodeType::Join,
                    children: vec![RuleMatcher::Any, RuleMatcher::Any],
                },
                RuleMatcher::MatchDiscriminant {
                    typ_discriminant: std::mem::discriminant(&TestNodeType::Scan),
                    children: vec![],
                },
            ],
        };
        let depths = matcher
            .kind_operands()
            .into_iter()
            .map(|(depth, _)| depth)
            .collect::<Vec<_>>();
        assert_eq!(depths, vec![0, 1, 1]);
    }

    #[test]
    fn predicate_operand() {
        let matcher = RuleMatcher::<TestNodeType>::MatchPredicate {
            name: "logical",
            predicate: |typ| crate::nodes::NodeType::is_logical(typ),
            children: vec![],
        };
        assert!(matcher.accepts(&TestNodeType::Join));
        assert!(!matcher.accepts(&TestNodeType::HashJoin));
        assert!(RuleMatcher::Any.accepts(&TestNodeType::HashJoin));
    }
}

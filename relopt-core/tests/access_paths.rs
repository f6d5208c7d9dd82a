// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Picking between two access paths through the public API only.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use pretty_assertions::assert_eq;
use relopt_core::cascades::{
    CascadesOptimizer, MemoPlanNode, MetadataQuery, OptimizerProperties, OptimizerTrace,
    RelNodeContext, RuleMatchOrder, TieBreak,
};
use relopt_core::cost::{Cost, CostModel};
use relopt_core::nodes::{ArcPlanNode, NodeType, PlanNode, PlanNodeOrGroup, RowType, Value};
use relopt_core::physical_property::{
    Collation, CollationPropertyBuilder, Convention, ConventionPropertyBuilder, Distribution,
    DistributionPropertyBuilder, PhysicalProperty, PhysicalPropertyRegistry, PhysicalPropertySet,
};
use relopt_core::rules::{Rule, RuleMatcher};
use test_case::test_case;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Get,
    SeqScan,
    IndexScan,
    Sort,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl NodeType for Op {
    fn is_logical(&self) -> bool {
        matches!(self, Op::Get)
    }
}

type Planner = CascadesOptimizer<Op>;

fn row_type() -> RowType {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]))
}

fn props(convention: Convention, sorted_by: Vec<usize>) -> PhysicalPropertySet {
    PhysicalPropertySet::new(vec![
        PhysicalProperty::Convention(convention),
        PhysicalProperty::Collation(Collation::asc(sorted_by)),
        PhysicalProperty::Distribution(Distribution::Any),
    ])
}

fn get(table: &str) -> ArcPlanNode<Op> {
    Arc::new(PlanNode {
        typ: Op::Get,
        children: vec![],
        data: Some(Value::String(table.into())),
        row_type: row_type(),
        props: props(Convention::Logical, vec![]),
    })
}

/// Implements `Get` as a scan delivering `sorted_by`.
struct AccessPath {
    matcher: RuleMatcher<Op>,
    typ: Op,
    sorted_by: Vec<usize>,
    priority: i32,
    name: &'static str,
}

impl AccessPath {
    fn new(typ: Op, sorted_by: Vec<usize>, priority: i32, name: &'static str) -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: Op::Get,
                children: vec![],
            },
            typ,
            sorted_by,
            priority,
            name,
        }
    }
}

impl Rule<Op, Planner> for AccessPath {
    fn matcher(&self) -> &RuleMatcher<Op> {
        &self.matcher
    }

    fn apply(&self, _optimizer: &Planner, binding: ArcPlanNode<Op>) -> Vec<PlanNodeOrGroup<Op>> {
        vec![binding
            .with_typ(
                self.typ,
                props(Convention::named("row"), self.sorted_by.clone()),
            )
            .into()]
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_impl_rule(&self) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        self.priority
    }
}

struct FlatCost;

impl CostModel<Op> for FlatCost {
    fn compute_operation_cost(
        &self,
        node: &MemoPlanNode<Op>,
        _children_costs: &[Cost],
        _context: &RelNodeContext,
        _metadata: &mut MetadataQuery<'_, Op>,
    ) -> Cost {
        match node.typ {
            Op::SeqScan | Op::IndexScan => Cost(vec![10.0]),
            Op::Sort => Cost(vec![5.0]),
            Op::Get => Cost(vec![f64::NAN]),
        }
    }

    fn estimated_row_count(
        &self,
        _node: &MemoPlanNode<Op>,
        _metadata: &mut MetadataQuery<'_, Op>,
    ) -> Option<f64> {
        Some(100.0)
    }

    fn weighted_cost(&self, cost: &Cost) -> f64 {
        cost.0[0]
    }

    fn explain_cost(&self, cost: &Cost) -> String {
        format!("{:.1}", cost.0[0])
    }

    fn accumulate(&self, total_cost: &mut Cost, cost: &Cost) {
        total_cost.0[0] += cost.0[0];
    }

    fn zero(&self) -> Cost {
        Cost(vec![0.0])
    }
}

fn planner(prop: OptimizerProperties) -> Planner {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
    let registry: PhysicalPropertyRegistry<Op> = PhysicalPropertyRegistry::new(vec![
        Box::new(ConventionPropertyBuilder::new()),
        Box::new(CollationPropertyBuilder::new(Some(Op::Sort))),
        Box::new(DistributionPropertyBuilder::new(None)),
    ]);
    CascadesOptimizer::new_with_options(
        vec![
            Arc::new(AccessPath::new(Op::SeqScan, vec![], 0, "seq_scan")),
            Arc::new(AccessPath::new(Op::IndexScan, vec![0], 10, "index_scan")),
        ],
        Box::new(FlatCost),
        registry,
        Arc::new([]),
        prop,
    )
}

fn fired_rules(optimizer: &Planner) -> Vec<String> {
    optimizer
        .trace()
        .filter_map(|event| match event {
            OptimizerTrace::ApplyRule { rule, .. } => Some(rule.clone()),
            _ => None,
        })
        .collect()
}

#[test_case(RuleMatchOrder::Fifo, &["seq_scan", "index_scan"]; "fifo")]
#[test_case(RuleMatchOrder::Priority, &["index_scan", "seq_scan"]; "priority")]
fn match_order(match_order: RuleMatchOrder, expected: &[&str]) {
    let mut optimizer = planner(OptimizerProperties {
        match_order,
        ..Default::default()
    });
    optimizer
        .optimize_with_outcome(get("t"), &props(Convention::named("row"), vec![]))
        .unwrap();
    assert_eq!(fired_rules(&optimizer), expected);
}

#[test_case(TieBreak::KeepIncumbent, Op::SeqScan; "keep incumbent")]
#[test_case(TieBreak::PreferLowerExprId, Op::SeqScan; "lower id")]
#[test_case(TieBreak::PreferHigherExprId, Op::IndexScan; "higher id")]
fn equal_costs_follow_the_tie_break(tie_break: TieBreak, expected: Op) {
    let mut optimizer = planner(OptimizerProperties {
        tie_break,
        ..Default::default()
    });
    let outcome = optimizer
        .optimize_with_outcome(get("t"), &props(Convention::named("row"), vec![]))
        .unwrap();
    assert_eq!(outcome.plan.typ, expected);
    assert_eq!(outcome.cost, Some(Cost(vec![10.0])));
}

#[test]
fn ordered_access_path_beats_sorting() {
    let mut optimizer = planner(OptimizerProperties::default());
    let outcome = optimizer
        .optimize_with_outcome(get("t"), &props(Convention::named("row"), vec![0]))
        .unwrap();
    assert_eq!(outcome.plan.typ, Op::IndexScan);
    assert_eq!(outcome.cost, Some(Cost(vec![10.0])));
}

#[test]
fn sort_is_added_when_no_path_is_ordered() {
    let mut optimizer = planner(OptimizerProperties::default());
    optimizer.disable_rule_by_name("index_scan").unwrap();
    let outcome = optimizer
        .optimize_with_outcome(get("t"), &props(Convention::named("row"), vec![1]))
        .unwrap();
    assert_eq!(outcome.plan.typ, Op::Sort);
    assert_eq!(outcome.plan.child_rel(0).typ, Op::SeqScan);
    assert_eq!(outcome.cost, Some(Cost(vec![15.0])));
}

#[test]
fn trace_exports_as_json() {
    let mut optimizer = planner(OptimizerProperties::default());
    optimizer
        .optimize_with_outcome(get("t"), &props(Convention::named("row"), vec![]))
        .unwrap();
    let events = serde_json::to_value(optimizer.take_trace()).unwrap();
    let events = events.as_array().unwrap();
    assert_eq!(events[0]["RuleMatched"]["rule"], "seq_scan");
    assert_eq!(events[0]["RuleMatched"]["step"], 1);
    assert!(optimizer.trace().next().is_none());
}

#[test]
fn tracing_can_be_turned_off() {
    let mut optimizer = planner(OptimizerProperties {
        enable_tracing: false,
        ..Default::default()
    });
    optimizer
        .optimize_with_outcome(get("t"), &props(Convention::named("row"), vec![]))
        .unwrap();
    assert!(optimizer.trace().next().is_none());
    assert_eq!(optimizer.stats.apply_rule_count, 2);
}

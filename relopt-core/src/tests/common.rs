// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};

use crate::cascades::{CascadesOptimizer, MemoPlanNode, MetadataQuery, RelNodeContext};
use crate::cost::{Cost, CostModel};
use crate::logical_property::{LogicalPropertyBuilder, LogicalPropertyBuilderAny};
use crate::nodes::{
    ArcPlanNode, NodeType, PlanNode, PlanNodeOrGroup, RowType, SubGroupRef, Value,
};
use crate::physical_property::{
    Collation, CollationPropertyBuilder, Convention, ConventionPropertyBuilder, Distribution,
    DistributionPropertyBuilder, PhysicalProperty, PhysicalPropertyRegistry, PhysicalPropertySet,
};
use crate::rules::{Rule, RuleMatcher};

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub(crate) enum TestNodeType {
    Scan,
    Filter,
    Join,
    Project,
    PhysicalScan,
    IndexScan,
    PhysicalFilter,
    HashJoin,
    Sort,
    Exchange,
    Converter,
}

impl NodeType for TestNodeType {
    fn is_logical(&self) -> bool {
        matches!(self, Self::Scan | Self::Filter | Self::Join | Self::Project)
    }
}

pub(crate) type TestOptimizer = CascadesOptimizer<TestNodeType>;

pub(crate) fn row_type_of(columns: usize) -> RowType {
    Arc::new(Schema::new(
        (0..columns)
            .map(|i| Field::new(format!("c{i}"), DataType::Int64, true))
            .collect::<Vec<_>>(),
    ))
}

pub(crate) fn registry() -> PhysicalPropertyRegistry<TestNodeType> {
    PhysicalPropertyRegistry::new(vec![
        Box::new(
            ConventionPropertyBuilder::new().with_converter(
                "physical",
                "vectorized",
                TestNodeType::Converter,
            ),
        ),
        Box::new(CollationPropertyBuilder::new(Some(TestNodeType::Sort))),
        Box::new(DistributionPropertyBuilder::new(Some(TestNodeType::Exchange))),
    ])
}

/// The same kinds, but nothing can be sorted.
pub(crate) fn registry_without_sort() -> PhysicalPropertyRegistry<TestNodeType> {
    PhysicalPropertyRegistry::new(vec![
        Box::new(ConventionPropertyBuilder::new()),
        Box::new(CollationPropertyBuilder::new(None)),
        Box::new(DistributionPropertyBuilder::new(Some(TestNodeType::Exchange))),
    ])
}

pub(crate) fn props(convention: Convention, sorted_by: Vec<usize>) -> PhysicalPropertySet {
    PhysicalPropertySet::new(vec![
        PhysicalProperty::Convention(convention),
        PhysicalProperty::Collation(Collation::asc(sorted_by)),
        PhysicalProperty::Distribution(Distribution::Any),
    ])
}

pub(crate) fn logical() -> PhysicalPropertySet {
    props(Convention::Logical, vec![])
}

pub(crate) fn physical() -> PhysicalPropertySet {
    props(Convention::named("physical"), vec![])
}

pub(crate) fn physical_sorted(columns: Vec<usize>) -> PhysicalPropertySet {
    props(Convention::named("physical"), columns)
}

fn node(
    typ: TestNodeType,
    children: Vec<PlanNodeOrGroup<TestNodeType>>,
    data: Option<Value>,
    row_type: RowType,
    props: PhysicalPropertySet,
) -> ArcPlanNode<TestNodeType> {
    Arc::new(PlanNode {
        typ,
        children,
        data,
        row_type,
        props,
    })
}

pub(crate) fn scan(table: &str) -> ArcPlanNode<TestNodeType> {
    node(
        TestNodeType::Scan,
        vec![],
        Some(Value::String(table.into())),
        row_type_of(2),
        logical(),
    )
}

pub(crate) fn physical_scan(table: &str) -> ArcPlanNode<TestNodeType> {
    node(
        TestNodeType::PhysicalScan,
        vec![],
        Some(Value::String(table.into())),
        row_type_of(2),
        physical(),
    )
}

pub(crate) fn filter(child: ArcPlanNode<TestNodeType>, predicate: i64) -> ArcPlanNode<TestNodeType> {
    let row_type = child.row_type.clone();
    node(
        TestNodeType::Filter,
        vec![child.into()],
        Some(Value::Int64(predicate)),
        row_type,
        logical(),
    )
}

pub(crate) fn join(
    left: ArcPlanNode<TestNodeType>,
    right: ArcPlanNode<TestNodeType>,
) -> ArcPlanNode<TestNodeType> {
    let row_type = row_type_of(left.row_type.fields().len() + right.row_type.fields().len());
    node(
        TestNodeType::Join,
        vec![left.into(), right.into()],
        None,
        row_type,
        logical(),
    )
}

fn group_columns(optimizer: &TestOptimizer, child: &PlanNodeOrGroup<TestNodeType>) -> usize {
    match child {
        PlanNodeOrGroup::PlanNode(node) => node.row_type.fields().len(),
        PlanNodeOrGroup::Group(group) => optimizer
            .memo()
            .get_group(group.group_id)
            .map(|g| g.row_type().fields().len())
            .unwrap_or_default(),
    }
}

fn require(child: &PlanNodeOrGroup<TestNodeType>, props: PhysicalPropertySet) -> PlanNodeOrGroup<TestNodeType> {
    PlanNodeOrGroup::Group(SubGroupRef::new(child.unwrap_group().group_id, props))
}

/// Scan -> PhysicalScan, Filter -> PhysicalFilter, Join -> HashJoin.
pub(crate) struct ImplementRule {
    matcher: RuleMatcher<TestNodeType>,
    to: TestNodeType,
    name: &'static str,
}

impl ImplementRule {
    pub(crate) fn new(from: TestNodeType, to: TestNodeType, arity: usize, name: &'static str) -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: from,
                children: vec![RuleMatcher::Any; arity],
            },
            to,
            name,
        }
    }
}

impl Rule<TestNodeType, TestOptimizer> for ImplementRule {
    fn matcher(&self) -> &RuleMatcher<TestNodeType> {
        &self.matcher
    }

    fn apply(
        &self,
        _optimizer: &TestOptimizer,
        binding: ArcPlanNode<TestNodeType>,
    ) -> Vec<PlanNodeOrGroup<TestNodeType>> {
        let children = binding
            .children
            .iter()
            .map(|child| require(child, physical()))
            .collect();
        vec![PlanNode {
            typ: self.to,
            children,
            data: binding.data.clone(),
            row_type: binding.row_type.clone(),
            props: physical(),
        }
        .into()]
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_impl_rule(&self) -> bool {
        true
    }
}

pub(crate) fn implementation_rules() -> Vec<Arc<dyn Rule<TestNodeType, TestOptimizer>>> {
    vec![
        Arc::new(ImplementRule::new(TestNodeType::Scan, TestNodeType::PhysicalScan, 0, "implement_scan")),
        Arc::new(ImplementRule::new(TestNodeType::Filter, TestNodeType::PhysicalFilter, 1, "implement_filter")),
        Arc::new(ImplementRule::new(TestNodeType::Join, TestNodeType::HashJoin, 2, "implement_join")),
    ]
}

/// Replaces a leaf node kind by another one, keeping everything else.
pub(crate) struct ReplaceRule {
    matcher: RuleMatcher<TestNodeType>,
    to: TestNodeType,
    name: &'static str,
}

impl ReplaceRule {
    pub(crate) fn new(from: TestNodeType, to: TestNodeType, name: &'static str) -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: from,
                children: vec![],
            },
            to,
            name,
        }
    }
}

impl Rule<TestNodeType, TestOptimizer> for ReplaceRule {
    fn matcher(&self) -> &RuleMatcher<TestNodeType> {
        &self.matcher
    }

    fn apply(
        &self,
        _optimizer: &TestOptimizer,
        binding: ArcPlanNode<TestNodeType>,
    ) -> Vec<PlanNodeOrGroup<TestNodeType>> {
        vec![binding.with_typ(self.to, binding.props.clone()).into()]
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn is_impl_rule(&self) -> bool {
        !self.to.is_logical()
    }
}

pub(crate) struct JoinCommuteRule {
    matcher: RuleMatcher<TestNodeType>,
}

impl JoinCommuteRule {
    pub(crate) fn new() -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: TestNodeType::Join,
                children: vec![RuleMatcher::Any, RuleMatcher::Any],
            },
        }
    }
}

impl Rule<TestNodeType, TestOptimizer> for JoinCommuteRule {
    fn matcher(&self) -> &RuleMatcher<TestNodeType> {
        &self.matcher
    }

    fn apply(
        &self,
        _optimizer: &TestOptimizer,
        binding: ArcPlanNode<TestNodeType>,
    ) -> Vec<PlanNodeOrGroup<TestNodeType>> {
        vec![binding
            .with_children(vec![binding.child(1), binding.child(0)])
            .into()]
    }

    fn name(&self) -> &'static str {
        "join_commute"
    }
}

/// (A join B) join C -> A join (B join C)
pub(crate) struct JoinAssocRule {
    matcher: RuleMatcher<TestNodeType>,
}

impl JoinAssocRule {
    pub(crate) fn new() -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: TestNodeType::Join,
                children: vec![
                    RuleMatcher::MatchNode {
                        typ: TestNodeType::Join,
                        children: vec![RuleMatcher::Any, RuleMatcher::Any],
                    },
                    RuleMatcher::Any,
                ],
            },
        }
    }
}

impl Rule<TestNodeType, TestOptimizer> for JoinAssocRule {
    fn matcher(&self) -> &RuleMatcher<TestNodeType> {
        &self.matcher
    }

    fn apply(
        &self,
        optimizer: &TestOptimizer,
        binding: ArcPlanNode<TestNodeType>,
    ) -> Vec<PlanNodeOrGroup<TestNodeType>> {
        let left = binding.child_rel(0);
        let (a, b, c) = (left.child(0), left.child(1), binding.child(1));
        let columns = group_columns(optimizer, &b) + group_columns(optimizer, &c);
        let inner = node(
            TestNodeType::Join,
            vec![b, c],
            None,
            row_type_of(columns),
            logical(),
        );
        vec![binding.with_children(vec![a, inner.into()]).into()]
    }

    fn name(&self) -> &'static str {
        "join_assoc"
    }
}

/// Hands the same output to the memo twice, the second time through a different expression.
pub(crate) struct DuplicateFilterRule {
    matcher: RuleMatcher<TestNodeType>,
    name: &'static str,
}

impl DuplicateFilterRule {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: TestNodeType::Filter,
                children: vec![RuleMatcher::Any],
            },
            name,
        }
    }
}

impl Rule<TestNodeType, TestOptimizer> for DuplicateFilterRule {
    fn matcher(&self) -> &RuleMatcher<TestNodeType> {
        &self.matcher
    }

    fn apply(
        &self,
        _optimizer: &TestOptimizer,
        binding: ArcPlanNode<TestNodeType>,
    ) -> Vec<PlanNodeOrGroup<TestNodeType>> {
        let mut rewritten = binding.as_ref().clone();
        rewritten.data = Some(Value::Int64(-1));
        vec![rewritten.into()]
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Returns a node with a wrong row type.
pub(crate) struct BrokenRule {
    matcher: RuleMatcher<TestNodeType>,
}

impl BrokenRule {
    pub(crate) fn new() -> Self {
        Self {
            matcher: RuleMatcher::MatchNode {
                typ: TestNodeType::Scan,
                children: vec![],
            },
        }
    }
}

impl Rule<TestNodeType, TestOptimizer> for BrokenRule {
    fn matcher(&self) -> &RuleMatcher<TestNodeType> {
        &self.matcher
    }

    fn apply(
        &self,
        _optimizer: &TestOptimizer,
        binding: ArcPlanNode<TestNodeType>,
    ) -> Vec<PlanNodeOrGroup<TestNodeType>> {
        let mut broken = binding.with_typ(TestNodeType::PhysicalScan, physical());
        broken.row_type = row_type_of(7);
        vec![broken.into()]
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

/// Scans read 1000 rows, an index scan 100. Filters keep a tenth, joins a hundredth of the
/// cross product.
#[derive(Default)]
pub(crate) struct TestCostModel;

impl TestCostModel {
    fn child_rows(
        node: &MemoPlanNode<TestNodeType>,
        idx: usize,
        metadata: &mut MetadataQuery<'_, TestNodeType>,
    ) -> Option<f64> {
        metadata.row_count(node.children.get(idx)?.group_id)
    }

    fn input_rows(
        node: &MemoPlanNode<TestNodeType>,
        idx: usize,
        metadata: &mut MetadataQuery<'_, TestNodeType>,
    ) -> f64 {
        Self::child_rows(node, idx, metadata).unwrap_or(f64::INFINITY)
    }
}

impl CostModel<TestNodeType> for TestCostModel {
    fn compute_operation_cost(
        &self,
        node: &MemoPlanNode<TestNodeType>,
        _children_costs: &[Cost],
        _context: &RelNodeContext,
        metadata: &mut MetadataQuery<'_, TestNodeType>,
    ) -> Cost {
        let cost = match node.typ {
            TestNodeType::PhysicalScan => 1000.0,
            TestNodeType::IndexScan => 100.0,
            TestNodeType::PhysicalFilter | TestNodeType::Exchange | TestNodeType::Converter => {
                Self::input_rows(node, 0, metadata)
            }
            TestNodeType::Sort => 2.0 * Self::input_rows(node, 0, metadata),
            TestNodeType::HashJoin => {
                Self::input_rows(node, 0, metadata) + 2.0 * Self::input_rows(node, 1, metadata)
            }
            _ => f64::NAN,
        };
        Cost(vec![cost])
    }

    fn estimated_row_count(
        &self,
        node: &MemoPlanNode<TestNodeType>,
        metadata: &mut MetadataQuery<'_, TestNodeType>,
    ) -> Option<f64> {
        match node.typ {
            TestNodeType::Scan | TestNodeType::PhysicalScan | TestNodeType::IndexScan => {
                Some(1000.0)
            }
            TestNodeType::Filter | TestNodeType::PhysicalFilter => {
                Some(Self::child_rows(node, 0, metadata)? * 0.1)
            }
            TestNodeType::Join | TestNodeType::HashJoin => Some(
                Self::child_rows(node, 0, metadata)? * Self::child_rows(node, 1, metadata)? * 0.01,
            ),
            _ => Self::child_rows(node, 0, metadata),
        }
    }

    fn weighted_cost(&self, cost: &Cost) -> f64 {
        cost.0.first().copied().unwrap_or(f64::NAN)
    }

    fn explain_cost(&self, cost: &Cost) -> String {
        format!("{:?}", cost.0)
    }

    fn accumulate(&self, total_cost: &mut Cost, cost: &Cost) {
        total_cost.0[0] += cost.0[0];
    }

    fn zero(&self) -> Cost {
        Cost(vec![0.0])
    }
}

/// Number of base tables below a group.
pub(crate) struct TableCountBuilder;

impl LogicalPropertyBuilder<TestNodeType> for TableCountBuilder {
    type Prop = usize;

    fn derive(&self, typ: &TestNodeType, _data: Option<&Value>, children: &[&usize]) -> usize {
        match typ {
            TestNodeType::Scan | TestNodeType::PhysicalScan | TestNodeType::IndexScan => 1,
            _ => children.iter().copied().sum(),
        }
    }

    fn property_name(&self) -> &'static str {
        "table_count"
    }
}

pub(crate) fn logical_props() -> Arc<[Box<dyn LogicalPropertyBuilderAny<TestNodeType>>]> {
    Arc::new([Box::new(TableCountBuilder) as Box<dyn LogicalPropertyBuilderAny<TestNodeType>>])
}

pub(crate) fn optimizer_with(
    rules: Vec<Arc<dyn Rule<TestNodeType, TestOptimizer>>>,
    registry: PhysicalPropertyRegistry<TestNodeType>,
    prop: crate::cascades::OptimizerProperties,
) -> TestOptimizer {
    CascadesOptimizer::new_with_options(
        rules,
        Box::new(TestCostModel),
        registry,
        logical_props(),
        prop,
    )
}

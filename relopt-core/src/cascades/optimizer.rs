// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::memo::{Memo, TieBreak};
use super::metadata::{MetadataCache, MetadataQuery};
use super::rule_match::{binding_to_plan_node, match_and_pick_expr, RuleIndex};
use super::rule_queue::{RuleMatch, RuleMatchOrder, RuleMatchQueue};
use crate::cost::{normalized_weighted_cost, Cost, CostModel};
use crate::error::OptimizerError;
use crate::logical_property::{LogicalPropertyBuilder, LogicalPropertyBuilderAny};
use crate::nodes::{ArcPlanNode, NodeType, PlanNodeOrGroup, SubGroupRef};
use crate::optimizer::Optimizer;
use crate::physical_property::{PhysicalPropertyRegistry, PhysicalPropertySet};
use crate::rules::Rule;

pub type RuleId = usize;

#[derive(Clone, Debug)]
pub struct OptimizerProperties {
    /// Panic the optimizer if the budget is reached, used in planner tests.
    pub panic_on_budget: bool,
    /// Stop after firing this many rule matches.
    pub iteration_budget: Option<usize>,
    /// Once the memo holds this many expressions, only implementation rules fire.
    pub plan_space_budget: Option<usize>,
    /// Stop searching after this much wall-clock time.
    pub time_budget: Option<Duration>,
    /// Record [`OptimizerTrace`] events.
    pub enable_tracing: bool,
    pub match_order: RuleMatchOrder,
    pub tie_break: TieBreak,
}

impl Default for OptimizerProperties {
    fn default() -> Self {
        Self {
            panic_on_budget: false,
            iteration_budget: None,
            plan_space_budget: None,
            time_budget: None,
            enable_tracing: true,
            match_order: RuleMatchOrder::default(),
            tie_break: TieBreak::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OptimizerPhase {
    #[default]
    Idle,
    Seeding,
    Searching,
    Extracting,
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum OptimizerTrace {
    /// A new binding of a rule was queued
    RuleMatched {
        step: usize,
        rule_id: RuleId,
        rule: String,
        exprs: Vec<ExprId>,
    },
    /// A rule fired
    ApplyRule {
        step: usize,
        rule_id: RuleId,
        rule: String,
        group_id: GroupId,
        binding: Vec<ExprId>,
        /// Expressions (or groups) the rule produced, after deduplication
        produced: Vec<String>,
    },
    /// Two groups turned out equivalent
    MergeGroup {
        step: usize,
        kept: GroupId,
        absorbed: GroupId,
    },
    /// A chain of enforcers was added to convert between two property sets
    AddEnforcer {
        step: usize,
        group_id: GroupId,
        from: String,
        to: String,
        exprs: Vec<ExprId>,
    },
    /// A sub group got a new winner
    DecideWinner {
        step: usize,
        sub_group_id: SubGroupId,
        group_id: GroupId,
        props: String,
        expr_id: ExprId,
        weighted_cost: f64,
    },
    BudgetExhausted {
        step: usize,
        reason: String,
    },
}

impl OptimizerTrace {
    pub fn step(&self) -> usize {
        match self {
            OptimizerTrace::RuleMatched { step, .. }
            | OptimizerTrace::ApplyRule { step, .. }
            | OptimizerTrace::MergeGroup { step, .. }
            | OptimizerTrace::AddEnforcer { step, .. }
            | OptimizerTrace::DecideWinner { step, .. }
            | OptimizerTrace::BudgetExhausted { step, .. } => *step,
        }
    }
}

impl Display for OptimizerTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerTrace::RuleMatched {
                step,
                rule_id,
                rule,
                exprs,
            } => write!(
                f,
                "step={} rule_matched rule={}({}) exprs=[{}]",
                step,
                rule,
                rule_id,
                exprs.iter().join(",")
            ),
            OptimizerTrace::ApplyRule {
                step,
                rule_id,
                rule,
                group_id,
                binding,
                produced,
            } => write!(
                f,
                "step={} apply_rule rule={}({}) group_id={} binding=[{}] produced=[{}]",
                step,
                rule,
                rule_id,
                group_id,
                binding.iter().join(","),
                produced.iter().join(",")
            ),
            OptimizerTrace::MergeGroup {
                step,
                kept,
                absorbed,
            } => write!(f, "step={} merge_group kept={} absorbed={}", step, kept, absorbed),
            OptimizerTrace::AddEnforcer {
                step,
                group_id,
                from,
                to,
                exprs,
            } => write!(
                f,
                "step={} add_enforcer group_id={} from={} to={} exprs=[{}]",
                step,
                group_id,
                from,
                to,
                exprs.iter().join(",")
            ),
            OptimizerTrace::DecideWinner {
                step,
                sub_group_id,
                group_id,
                props,
                expr_id,
                weighted_cost,
            } => write!(
                f,
                "step={} decide_winner sub_group_id={} group_id={} props={} winner_expr={} total_weighted_cost={}",
                step, sub_group_id, group_id, props, expr_id, weighted_cost
            ),
            OptimizerTrace::BudgetExhausted { step, reason } => {
                write!(f, "step={} budget_exhausted reason={}", step, reason)
            }
        }
    }
}

#[derive(Default, Clone, Debug)]
pub struct CascadesStats {
    /// Times each rule fired.
    pub rule_match_count: HashMap<RuleId, usize>,
    /// Distinct bindings queued for each rule.
    pub rule_total_bindings: HashMap<RuleId, usize>,
    pub apply_rule_count: usize,
    pub merge_group_count: usize,
    pub enforcer_count: usize,
    pub cost_computed_count: usize,
}

/// The result of one optimization call.
#[derive(Clone, Debug)]
pub struct OptimizeOutcome<T: NodeType> {
    pub plan: ArcPlanNode<T>,
    /// Cost of the plan, or `None` if the search ran out of budget before any plan satisfied the
    /// root requirement and the seeded input is returned as is.
    pub cost: Option<Cost>,
    pub root_group: GroupId,
    /// The search stopped before reaching a fixed point.
    pub budget_exhausted: bool,
}

/// `PlanNode` only contains the representation of the plan nodes. Sometimes, we need more context,
/// i.e., group id and expr id, during the optimization phase. All these information are collected
/// in this struct.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct RelNodeContext {
    pub group_id: GroupId,
    pub expr_id: ExprId,
    pub children: Vec<SubGroupRef>,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Serialize)]
pub struct GroupId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Serialize)]
pub struct ExprId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Hash, Serialize)]
pub struct SubGroupId(pub usize);

impl Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{}", self.0)
    }
}

impl Display for ExprId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for SubGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

pub struct CascadesOptimizer<T: NodeType> {
    pub memo: Memo<T>,
    rules: Vec<Arc<dyn Rule<T, Self>>>,
    disabled_rules: HashSet<RuleId>,
    removed_rules: HashSet<RuleId>,
    rule_index: RuleIndex<T>,
    queue: RuleMatchQueue,
    pub cost: Arc<dyn CostModel<T>>,
    physical_props: Arc<PhysicalPropertyRegistry<T>>,
    logical_property_builders: Arc<[Box<dyn LogicalPropertyBuilderAny<T>>]>,
    metadata_cache: RefCell<MetadataCache>,
    /// `(group, delivered, required)` conversions already tried.
    attempted_enforcers: HashSet<(GroupId, PhysicalPropertySet, PhysicalPropertySet)>,
    pub prop: OptimizerProperties,
    pub stats: CascadesStats,
    trace: Vec<OptimizerTrace>,
    trace_steps: usize,
    phase: OptimizerPhase,
    root: Option<SubGroupRef>,
    seed: Option<ArcPlanNode<T>>,
    /// Number of rule matches fired in the current search.
    steps: usize,
    budget_exhausted: bool,
    search_start: Option<Instant>,
}

impl<T: NodeType> CascadesOptimizer<T> {
    pub fn new(
        rules: Vec<Arc<dyn Rule<T, Self>>>,
        cost: Box<dyn CostModel<T>>,
        physical_props: PhysicalPropertyRegistry<T>,
        logical_property_builders: Arc<[Box<dyn LogicalPropertyBuilderAny<T>>]>,
    ) -> Self {
        Self::new_with_options(
            rules,
            cost,
            physical_props,
            logical_property_builders,
            Default::default(),
        )
    }

    pub fn new_with_options(
        rules: Vec<Arc<dyn Rule<T, Self>>>,
        cost: Box<dyn CostModel<T>>,
        physical_props: PhysicalPropertyRegistry<T>,
        logical_property_builders: Arc<[Box<dyn LogicalPropertyBuilderAny<T>>]>,
        prop: OptimizerProperties,
    ) -> Self {
        let physical_props = Arc::new(physical_props);
        let memo = Memo::new(
            physical_props.clone(),
            logical_property_builders.clone(),
            prop.tie_break,
        );
        let mut rule_index = RuleIndex::new();
        for (rule_id, rule) in rules.iter().enumerate() {
            rule_index.add_rule(rule_id, rule.matcher());
        }
        Self {
            memo,
            rules,
            disabled_rules: HashSet::new(),
            removed_rules: HashSet::new(),
            rule_index,
            queue: RuleMatchQueue::new(prop.match_order),
            cost: cost.into(),
            physical_props,
            logical_property_builders,
            metadata_cache: RefCell::new(MetadataCache::default()),
            attempted_enforcers: HashSet::new(),
            prop,
            stats: CascadesStats::default(),
            trace: Vec::new(),
            trace_steps: 0,
            phase: OptimizerPhase::Idle,
            root: None,
            seed: None,
            steps: 0,
            budget_exhausted: false,
            search_start: None,
        }
    }

    pub fn cost(&self) -> Arc<dyn CostModel<T>> {
        self.cost.clone()
    }

    pub fn rules(&self) -> &[Arc<dyn Rule<T, Self>>] {
        &self.rules
    }

    pub fn memo(&self) -> &Memo<T> {
        &self.memo
    }

    pub fn phase(&self) -> OptimizerPhase {
        self.phase
    }

    /// Registers a rule. During a search the rule is matched against the existing memo
    /// immediately, so it sees every expression registered so far.
    pub fn add_rule(&mut self, rule: Arc<dyn Rule<T, Self>>) -> RuleId {
        let rule_id = self.rules.len();
        self.rule_index.add_rule(rule_id, rule.matcher());
        debug!(event = "add_rule", rule_id = rule_id, rule = rule.name());
        self.rules.push(rule);
        self.reindex_rule(rule_id);
        rule_id
    }

    /// Removes a rule. Its queued matches are dropped when popped.
    pub fn remove_rule(&mut self, rule_id: RuleId) -> Result<()> {
        ensure!(rule_id < self.rules.len(), "rule {} not found", rule_id);
        self.rule_index.remove_rule(rule_id);
        self.removed_rules.insert(rule_id);
        Ok(())
    }

    pub fn disable_rule(&mut self, rule_id: RuleId) {
        self.disabled_rules.insert(rule_id);
    }

    /// Re-enables a rule. Matches skipped while it was disabled are found again.
    pub fn enable_rule(&mut self, rule_id: RuleId) {
        if self.disabled_rules.remove(&rule_id) {
            self.reindex_rule(rule_id);
        }
    }

    pub fn disable_rule_by_name(&mut self, rule_name: &str) -> Result<()> {
        let ids = self.rule_ids_by_name(rule_name)?;
        for id in ids {
            self.disable_rule(id);
        }
        Ok(())
    }

    pub fn enable_rule_by_name(&mut self, rule_name: &str) -> Result<()> {
        let ids = self.rule_ids_by_name(rule_name)?;
        for id in ids {
            self.enable_rule(id);
        }
        Ok(())
    }

    fn rule_ids_by_name(&self, rule_name: &str) -> Result<Vec<RuleId>> {
        let ids = self
            .rules
            .iter()
            .enumerate()
            .filter(|(id, rule)| rule.name() == rule_name && !self.removed_rules.contains(id))
            .map(|(id, _)| id)
            .collect_vec();
        if ids.is_empty() {
            bail!("rule {} not found", rule_name);
        }
        Ok(ids)
    }

    pub fn is_rule_disabled(&self, rule_id: RuleId) -> bool {
        self.disabled_rules.contains(&rule_id)
    }

    fn is_rule_active(&self, rule_id: RuleId) -> bool {
        !self.disabled_rules.contains(&rule_id) && !self.removed_rules.contains(&rule_id)
    }

    /// Recorded trace events, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = &OptimizerTrace> {
        self.trace.iter()
    }

    pub fn take_trace(&mut self) -> Vec<OptimizerTrace> {
        std::mem::take(&mut self.trace)
    }

    fn record(&mut self, make: impl FnOnce(usize) -> OptimizerTrace) {
        if self.prop.enable_tracing {
            self.trace_steps += 1;
            self.trace.push(make(self.trace_steps));
        }
    }

    /// Get the properties of a Cascades group
    /// P is the type of the property you expect
    /// idx is the idx of the property you want. The order of properties is defined
    ///   by the property_builders parameter in CascadesOptimizer::new()
    pub fn get_property_by_group<P: LogicalPropertyBuilder<T>>(
        &self,
        group_id: GroupId,
        idx: usize,
    ) -> Result<P::Prop, OptimizerError> {
        let group = self.memo.get_group(group_id)?;
        group
            .properties
            .get(idx)
            .and_then(|prop| prop.downcast_ref::<P::Prop>())
            .cloned()
            .ok_or_else(|| {
                OptimizerError::Internal(format!(
                    "group {group_id} has no logical property {idx} of type {}",
                    std::any::type_name::<P::Prop>()
                ))
            })
    }

    /// Estimated output rows of a group, or `None` if unknown.
    pub fn get_row_count(&self, group_id: GroupId) -> Option<f64> {
        let mut cache = self.metadata_cache.borrow_mut();
        MetadataQuery::new(&self.memo, self.cost.as_ref(), &mut cache).row_count(group_id)
    }

    pub fn dump(&self, mut f: impl std::fmt::Write) -> std::fmt::Result {
        for group_id in self.memo.get_all_group_ids() {
            let Ok(group) = self.memo.get_group(group_id) else {
                continue;
            };
            writeln!(f, "group_id={} row_type={}", group_id, group.row_type())?;
            for (id, property) in self.logical_property_builders.iter().enumerate() {
                writeln!(
                    f,
                    "  {}={}",
                    property.property_name(),
                    property.display(group.properties[id].as_ref())
                )?;
            }
            for sub_group_id in group.sub_groups() {
                let sub_group = self.memo.get_sub_group(*sub_group_id);
                let winner_str = match &sub_group.winner {
                    None => "winner=<unknown>".to_string(),
                    Some(winner) => format!(
                        "winner={} weighted_cost={} cost={}",
                        winner.expr_id,
                        winner.weighted_cost,
                        self.cost.explain_cost(&winner.cost)
                    ),
                };
                writeln!(
                    f,
                    "  sub_group_id={} props={} required={} {}",
                    sub_group_id, sub_group.props, sub_group.required, winner_str
                )?;
            }
            for expr_id in group.group_exprs() {
                let memo_node = self.memo.get_expr_memoed(*expr_id);
                writeln!(f, "  expr_id={} | {} -> {}", expr_id, memo_node, memo_node.props)?;
            }
        }
        Ok(())
    }

    pub fn dump_stats(&self, mut f: impl std::fmt::Write) -> std::fmt::Result {
        writeln!(f, "plan_space={}", self.memo.estimated_plan_space())?;
        for (id, rule) in self.rules.iter().enumerate() {
            writeln!(
                f,
                "{}: matched={}, bindings={}",
                rule.name(),
                self.stats
                    .rule_match_count
                    .get(&id)
                    .copied()
                    .unwrap_or_default(),
                self.stats
                    .rule_total_bindings
                    .get(&id)
                    .copied()
                    .unwrap_or_default()
            )?;
        }
        writeln!(f, "apply_rule_count={}", self.stats.apply_rule_count)?;
        writeln!(f, "merge_group_count={}", self.stats.merge_group_count)?;
        writeln!(f, "enforcer_count={}", self.stats.enforcer_count)?;
        writeln!(f, "cost_computed_count={}", self.stats.cost_computed_count)
    }

    /// Clear the memo table and all per-call states. Rules and their enabled state are kept.
    pub fn step_clear(&mut self) {
        self.memo = Memo::new(
            self.physical_props.clone(),
            self.logical_property_builders.clone(),
            self.prop.tie_break,
        );
        self.queue = RuleMatchQueue::new(self.prop.match_order);
        self.metadata_cache.borrow_mut().clear();
        self.attempted_enforcers.clear();
        self.stats = CascadesStats::default();
        self.trace.clear();
        self.trace_steps = 0;
        self.phase = OptimizerPhase::Idle;
        self.root = None;
        self.seed = None;
        self.steps = 0;
        self.budget_exhausted = false;
        self.search_start = None;
    }

    /// Inserts the input tree into the memo and records the root requirement.
    pub fn step_seed(
        &mut self,
        root_rel: ArcPlanNode<T>,
        required_props: &PhysicalPropertySet,
    ) -> Result<GroupId> {
        ensure!(
            self.phase == OptimizerPhase::Idle,
            "cannot seed an optimizer in phase {:?}, clear it first",
            self.phase
        );
        self.physical_props.check_arity(required_props)?;
        self.phase = OptimizerPhase::Seeding;
        trace!(event = "step_seed", rel = %root_rel, required = %required_props);
        let (group_id, _) = self.memo.add_new_expr(root_rel.clone())?;
        let root = SubGroupRef::new(group_id, required_props.clone());
        self.memo.get_or_create_sub_group(&root, true)?;
        self.root = Some(root);
        self.seed = Some(root_rel);
        self.process_changes()?;
        self.phase = OptimizerPhase::Searching;
        self.search_start = Some(Instant::now());
        Ok(self.memo.reduce_group(group_id))
    }

    /// Fires queued rule matches until a fixed point is reached or a budget runs out.
    pub fn step_search(&mut self) -> Result<()> {
        ensure!(
            self.phase == OptimizerPhase::Searching,
            "cannot search in phase {:?}",
            self.phase
        );
        let start = *self.search_start.get_or_insert_with(Instant::now);
        loop {
            // an empty queue is the fixed point, even if the budget ran out on the last firing
            if self.queue.is_empty() {
                break;
            }
            if let Some(reason) = self.exhausted_budget(start) {
                self.on_budget_exhausted(reason);
                break;
            }
            let Some(rule_match) = self.queue.pop() else {
                break;
            };
            if self.removed_rules.contains(&rule_match.rule_id) {
                continue;
            }
            if self.disabled_rules.contains(&rule_match.rule_id) {
                // found again by `enable_rule`
                self.queue.forget(&rule_match);
                continue;
            }
            let rule = self.rules[rule_match.rule_id].clone();
            if !rule.is_impl_rule() && self.plan_space_exceeded() {
                if !self.budget_exhausted {
                    self.on_budget_exhausted("plan space budget");
                }
                continue;
            }
            self.fire(rule_match)?;
        }
        debug!(
            event = "search_done",
            steps = self.steps,
            pending = self.queue.len(),
            plan_space = self.memo.estimated_plan_space(),
            budget_exhausted = self.budget_exhausted
        );
        Ok(())
    }

    /// Picks the cheapest plan satisfying the root requirement.
    pub fn step_extract(&mut self) -> Result<OptimizeOutcome<T>> {
        let root = self.root.clone().context("optimizer has not been seeded")?;
        self.phase = OptimizerPhase::Extracting;
        let root = self.memo.reduce_sub_group_ref(&root);
        let outcome = match self.memo.get_best_sub_group_binding(&root) {
            Ok(plan) => OptimizeOutcome {
                plan,
                cost: self
                    .memo
                    .get_sub_group_winner(&root)
                    .map(|winner| winner.cost.clone()),
                root_group: root.group_id,
                budget_exhausted: self.budget_exhausted,
            },
            Err(OptimizerError::PlanNotFound { .. }) if self.budget_exhausted && self.seed.is_some() => {
                warn!(event = "return_seed", root = %root, reason = "budget exhausted before a plan was found");
                OptimizeOutcome {
                    plan: self.seed.clone().context("seed vanished")?,
                    cost: None,
                    root_group: root.group_id,
                    budget_exhausted: true,
                }
            }
            Err(err) => {
                if cfg!(debug_assertions) {
                    let mut buf = String::new();
                    self.dump(&mut buf)?;
                    debug!(event = "extract_failed", error = %err, memo = %buf);
                }
                self.phase = OptimizerPhase::Done;
                return Err(err.into());
            }
        };
        self.phase = OptimizerPhase::Done;
        Ok(outcome)
    }

    /// Runs a full optimization call: clear, seed, search and extract.
    pub fn optimize_with_outcome(
        &mut self,
        root_rel: ArcPlanNode<T>,
        required_props: &PhysicalPropertySet,
    ) -> Result<OptimizeOutcome<T>> {
        self.step_clear();
        self.step_seed(root_rel, required_props)?;
        self.step_search()?;
        self.step_extract()
    }

    fn exhausted_budget(&self, start: Instant) -> Option<&'static str> {
        if let Some(budget) = self.prop.iteration_budget {
            if self.steps >= budget {
                return Some("iteration budget");
            }
        }
        if let Some(budget) = self.prop.time_budget {
            if start.elapsed() >= budget {
                return Some("time budget");
            }
        }
        None
    }

    fn plan_space_exceeded(&self) -> bool {
        self.prop
            .plan_space_budget
            .is_some_and(|budget| self.memo.estimated_plan_space() >= budget)
    }

    fn on_budget_exhausted(&mut self, reason: &'static str) {
        warn!(
            event = "budget_exhausted",
            reason = reason,
            steps = self.steps,
            plan_space = self.memo.estimated_plan_space()
        );
        self.budget_exhausted = true;
        self.record(|step| OptimizerTrace::BudgetExhausted {
            step,
            reason: reason.to_string(),
        });
        if self.prop.panic_on_budget {
            panic!("{} exhausted", reason);
        }
    }

    fn fire(&mut self, rule_match: RuleMatch) -> Result<()> {
        let rule_id = rule_match.rule_id;
        let rule = self.rules[rule_id].clone();
        let group_id = self.memo.get_group_id(rule_match.exprs[0]);
        let binding = binding_to_plan_node(rule.matcher(), &rule_match.exprs, &self.memo)?;
        self.steps += 1;
        self.stats.apply_rule_count += 1;
        *self.stats.rule_match_count.entry(rule_id).or_default() += 1;
        trace!(event = "apply_rule", rule = rule.name(), group_id = %group_id, binding = %binding);

        let outputs = rule.apply(self, binding.clone());
        let mut produced = Vec::with_capacity(outputs.len());
        for output in outputs {
            let group_id = self.memo.reduce_group(group_id);
            let expected = self.memo.get_group(group_id)?.row_type().clone();
            let actual = match &output {
                PlanNodeOrGroup::PlanNode(node) => node.row_type.clone(),
                PlanNodeOrGroup::Group(group) => self.memo.get_group(group.group_id)?.row_type().clone(),
            };
            if actual != expected {
                return Err(OptimizerError::InvalidRuleOutput {
                    rule: rule.name().to_string(),
                    binding: binding.to_string(),
                    reason: format!("produced row type {} for group {} of row type {}", actual, group_id, expected),
                }
                .into());
            }
            trace!(event = "rule_output", rule = rule.name(), group_id = %group_id, output = %output);
            let result = match &output {
                PlanNodeOrGroup::Group(group) => Some(format!("{}", self.memo.reduce_group(group.group_id))),
                PlanNodeOrGroup::PlanNode(_) => None,
            };
            let expr_id = self
                .memo
                .add_expr_to_group(output, group_id)
                .with_context(|| format!("rule {} on binding {}", rule.name(), binding))?;
            produced.push(expr_id.map(|x| x.to_string()).or(result).unwrap_or_default());
        }
        self.record(|step| OptimizerTrace::ApplyRule {
            step,
            rule_id,
            rule: rule.name().to_string(),
            group_id,
            binding: rule_match.exprs.clone(),
            produced,
        });
        self.process_changes()
    }

    /// Brings costs, winners, enforcers and the match queue up to date with the memo.
    fn process_changes(&mut self) -> Result<()> {
        loop {
            let changes = self.memo.take_changes();
            if changes.is_empty() {
                break;
            }
            if !changes.merged_groups.is_empty() {
                self.metadata_cache.borrow_mut().clear();
            }
            let mut affected_groups = BTreeSet::new();
            for (kept, absorbed) in &changes.merged_groups {
                self.stats.merge_group_count += 1;
                self.record(|step| OptimizerTrace::MergeGroup {
                    step,
                    kept: *kept,
                    absorbed: *absorbed,
                });
                affected_groups.insert(*kept);
            }
            for expr_id in &changes.new_exprs {
                self.compute_expr_cost(*expr_id);
                affected_groups.insert(self.memo.get_group_id(*expr_id));
            }
            let mut improved = HashSet::new();
            for sub_group_id in &changes.improved_sub_groups {
                let sub_group_id = self.memo.reduce_sub_group(*sub_group_id);
                if improved.insert(sub_group_id) {
                    self.on_winner_improved(sub_group_id)?;
                }
            }
            for sub_group_id in &changes.required_sub_groups {
                affected_groups.insert(self.memo.get_sub_group(*sub_group_id).group_id);
            }
            for group_id in affected_groups {
                self.add_enforcers(group_id)?;
            }
            for expr_id in &changes.new_exprs {
                self.index_expr(*expr_id);
            }
            for (kept, _) in &changes.merged_groups {
                for expr_id in self.memo.get_all_exprs_in_group(*kept) {
                    self.index_expr(expr_id);
                }
            }
        }
        if cfg!(debug_assertions) {
            self.memo.verify_integrity()?;
        }
        Ok(())
    }

    /// Computes the total cost of a physical expression if all its inputs have a winner.
    fn compute_expr_cost(&mut self, expr_id: ExprId) {
        let expr = self.memo.get_expr_memoed(expr_id);
        if expr.typ.is_logical() {
            return;
        }
        let mut children_costs = Vec::with_capacity(expr.children.len());
        for child in &expr.children {
            match self.memo.get_sub_group_winner(child) {
                Some(winner) => children_costs.push(winner.cost.clone()),
                None => return,
            }
        }
        let context = RelNodeContext {
            group_id: self.memo.get_group_id(expr_id),
            expr_id,
            children: expr.children.clone(),
        };
        let cost = {
            let mut cache = self.metadata_cache.borrow_mut();
            let mut metadata = MetadataQuery::new(&self.memo, self.cost.as_ref(), &mut cache);
            let operation_cost =
                self.cost
                    .compute_operation_cost(&expr, &children_costs, &context, &mut metadata);
            self.cost.sum(&operation_cost, &children_costs)
        };
        let weighted_cost = normalized_weighted_cost(self.cost.as_ref(), &cost);
        trace!(event = "compute_cost", expr_id = %expr_id, cost = %self.cost.explain_cost(&cost), weighted_cost = %weighted_cost);
        self.stats.cost_computed_count += 1;
        self.memo.update_expr_cost(expr_id, cost, weighted_cost);
    }

    /// Re-costs every parent reading from the improved sub group.
    fn on_winner_improved(&mut self, sub_group_id: SubGroupId) -> Result<()> {
        let sub_group = self.memo.get_sub_group(sub_group_id);
        let Some(winner) = sub_group.winner.clone() else {
            return Ok(());
        };
        let group_id = sub_group.group_id;
        let sub_group_ref = SubGroupRef::new(group_id, sub_group.props.clone());
        debug!(event = "decide_winner", sub_group = %sub_group_ref, expr_id = %winner.expr_id, weighted_cost = %winner.weighted_cost);
        self.record(|step| OptimizerTrace::DecideWinner {
            step,
            sub_group_id,
            group_id,
            props: sub_group_ref.props.to_string(),
            expr_id: winner.expr_id,
            weighted_cost: winner.weighted_cost,
        });
        let parents = self.memo.get_group(group_id)?.parents().collect_vec();
        for parent in parents {
            let node = self.memo.get_expr_memoed(parent);
            if node
                .children
                .iter()
                .any(|child| self.memo.reduce_sub_group_ref(child) == sub_group_ref)
            {
                self.compute_expr_cost(parent);
            }
        }
        Ok(())
    }

    /// Adds enforcers converting what physical members of the group deliver into what its
    /// required sub groups need. Each `(delivered, required)` pair is tried once.
    fn add_enforcers(&mut self, group_id: GroupId) -> Result<()> {
        let group_id = self.memo.reduce_group(group_id);
        let required = self
            .memo
            .get_sub_groups(group_id)
            .into_iter()
            .map(|id| self.memo.get_sub_group(id))
            .filter(|sub_group| sub_group.required)
            .map(|sub_group| sub_group.props.clone())
            .collect_vec();
        let delivered = self
            .memo
            .get_all_exprs_in_group(group_id)
            .into_iter()
            .map(|expr_id| self.memo.get_expr_memoed(expr_id))
            .filter(|expr| !expr.typ.is_logical())
            .map(|expr| expr.props.clone())
            .unique()
            .collect_vec();
        for actual in &delivered {
            for required in &required {
                if self.physical_props.satisfies(actual, required) {
                    continue;
                }
                let group_id = self.memo.reduce_group(group_id);
                if !self
                    .attempted_enforcers
                    .insert((group_id, actual.clone(), required.clone()))
                {
                    continue;
                }
                let input = SubGroupRef::new(group_id, actual.clone());
                let row_type = self.memo.get_group(group_id)?.row_type().clone();
                let Some(chain) = self.physical_props.convert(&input, &row_type, actual, required)
                else {
                    trace!(event = "enforcer_unavailable", group_id = %group_id, from = %actual, to = %required);
                    continue;
                };
                self.memo.get_or_create_sub_group(&input, false)?;
                let mut exprs = Vec::with_capacity(chain.len());
                for node in chain {
                    let group_id = self.memo.reduce_group(group_id);
                    if let Some(expr_id) = self.memo.add_enforcer_to_group(node, group_id)? {
                        exprs.push(expr_id);
                    }
                }
                trace!(event = "add_enforcer", group_id = %group_id, from = %actual, to = %required, exprs = %exprs.iter().join(","));
                self.stats.enforcer_count += 1;
                self.record(|step| OptimizerTrace::AddEnforcer {
                    step,
                    group_id,
                    from: actual.to_string(),
                    to: required.to_string(),
                    exprs,
                });
            }
        }
        Ok(())
    }

    /// Queues every binding the expression enables, as the root of a rule's pattern or nested in
    /// the pattern of one of its ancestors.
    fn index_expr(&mut self, expr_id: ExprId) {
        let node = self.memo.get_expr_memoed(expr_id);
        for (rule_id, depth) in self.rule_index.candidates(&node.typ) {
            if !self.is_rule_active(rule_id) {
                continue;
            }
            let rule = self.rules[rule_id].clone();
            for root in self.memo.get_ancestors(expr_id, depth) {
                for exprs in match_and_pick_expr(rule.matcher(), root, &self.memo) {
                    self.enqueue(rule_id, rule.as_ref(), exprs);
                }
            }
        }
    }

    /// Matches one rule against the whole memo.
    fn reindex_rule(&mut self, rule_id: RuleId) {
        if !self.is_rule_active(rule_id) {
            return;
        }
        let rule = self.rules[rule_id].clone();
        for group_id in self.memo.get_all_group_ids() {
            for expr_id in self.memo.get_all_exprs_in_group(group_id) {
                for exprs in match_and_pick_expr(rule.matcher(), expr_id, &self.memo) {
                    self.enqueue(rule_id, rule.as_ref(), exprs);
                }
            }
        }
    }

    fn enqueue(&mut self, rule_id: RuleId, rule: &dyn Rule<T, Self>, exprs: Vec<ExprId>) {
        let rule_match = RuleMatch {
            rule_id,
            exprs: exprs.clone(),
        };
        if !self.queue.push(rule_match, rule.priority()) {
            return;
        }
        trace!(event = "rule_matched", rule = rule.name(), exprs = %exprs.iter().join(","));
        *self.stats.rule_total_bindings.entry(rule_id).or_default() += 1;
        self.record(|step| OptimizerTrace::RuleMatched {
            step,
            rule_id,
            rule: rule.name().to_string(),
            exprs,
        });
    }
}

impl<T: NodeType> Optimizer<T> for CascadesOptimizer<T> {
    fn optimize(&mut self, root_rel: ArcPlanNode<T>) -> Result<ArcPlanNode<T>> {
        let required_props = self.physical_props.any();
        Ok(self.optimize_with_outcome(root_rel, &required_props)?.plan)
    }

    fn optimize_with_required_props(
        &mut self,
        root_rel: ArcPlanNode<T>,
        required_props: &PhysicalPropertySet,
    ) -> Result<ArcPlanNode<T>> {
        Ok(self.optimize_with_outcome(root_rel, required_props)?.plan)
    }

    fn get_property<P: LogicalPropertyBuilder<T>>(
        &self,
        group_id: GroupId,
        idx: usize,
    ) -> Result<P::Prop> {
        Ok(self.get_property_by_group::<P>(group_id, idx)?)
    }

    fn physical_property_registry(&self) -> &PhysicalPropertyRegistry<T> {
        &self.physical_props
    }
}

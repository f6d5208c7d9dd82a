// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The cascades-style optimizer: a memo of equivalent expressions searched by firing rule matches
//! to a fixed point.

mod memo;
mod metadata;
mod optimizer;
mod rule_match;
mod rule_queue;

pub use memo::{
    ArcMemoPlanNode, Group, Memo, MemoChanges, MemoPlanNode, SubGroup, TieBreak, Winner,
};
pub use metadata::{MetadataCache, MetadataQuery};
pub use optimizer::{
    CascadesOptimizer, CascadesStats, ExprId, GroupId, OptimizeOutcome, OptimizerPhase,
    OptimizerProperties, OptimizerTrace, RelNodeContext, RuleId, SubGroupId,
};
pub use rule_queue::{RuleMatch, RuleMatchOrder};

// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

#![allow(clippy::new_without_default)]

//! A memo-based (Volcano/Cascades style) relational query optimizer core.
//!
//! The crate hosts pluggable rules, a pluggable cost model and a pluggable set of physical
//! property kinds. It owns the search: the memo of equivalent expressions, incremental rule
//! matching, the firing loop, cost propagation and best plan extraction.

pub mod cascades;
pub mod cost;
pub mod error;
pub mod logical_property;
pub mod nodes;
pub mod optimizer;
pub mod physical_property;
pub mod rules;

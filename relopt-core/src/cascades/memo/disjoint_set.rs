// Copyright (c) 2023-2024 CMU Database Group
//
// Use of this source code is governed by an MIT-style license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// A data structure for efficiently maintaining disjoint sets of `T`. The memo uses it as the
/// redirect table from absorbed group ids to surviving ones.
pub struct DisjointSet<T> {
    /// Mapping from node to its parent.
    node_parents: HashMap<T, T>,
    /// Number of disjoint sets.
    num_sets: usize,
}

impl<T> DisjointSet<T>
where
    T: Ord + Hash + Copy + Debug,
{
    pub fn new() -> Self {
        DisjointSet {
            node_parents: HashMap::new(),
            num_sets: 0,
        }
    }

    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    pub fn add(&mut self, node: T) {
        use std::collections::hash_map::Entry;

        if let Entry::Vacant(entry) = self.node_parents.entry(node) {
            entry.insert(node);
            self.num_sets += 1;
        }
    }

    /// Gets the representative node of the set that `node` is in.
    /// A node is the representative if the its parent is the node itself.
    pub fn find(&self, node: &T) -> Option<T> {
        let mut current = *self.node_parents.get(node)?;
        loop {
            let parent = *self.node_parents.get(&current)?;
            if parent == current {
                return Some(current);
            }
            current = parent;
        }
    }

    /// Same as [`DisjointSet::find`], shortening the path from `node` to its representative.
    pub fn find_path_compress(&mut self, node: &T) -> Option<T> {
        let rep = self.find(node)?;
        let mut current = *node;
        while current != rep {
            let parent = self.node_parents[&current];
            self.node_parents.insert(current, rep);
            current = parent;
        }
        Some(rep)
    }

    /// Unions the set containing `absorb` into the set containing `keep`. The representative of
    /// `keep` stays the representative. Returns `[kept, absorbed]` representatives, or `None` if
    /// either node is unknown. Unioning a set with itself is a no-op.
    pub fn union_into(&mut self, keep: &T, absorb: &T) -> Option<[T; 2]> {
        let keep_rep = self.find_path_compress(keep)?;
        let absorb_rep = self.find_path_compress(absorb)?;
        if keep_rep != absorb_rep {
            self.node_parents.insert(absorb_rep, keep_rep);
            self.num_sets -= 1;
        }
        Some([keep_rep, absorb_rep])
    }
}

//! Dependency and evolution graph over entities.
//!
//! Edges point from the entity whose resolved value is needed to the entity that
//! needs it, so a topological order is a safe evaluation order:
//!
//! - `Supersedes`: `former` target → successor
//! - `DerivesFrom`: `derived_from` target → derived entity
//! - `FieldReference`: target of a value lookup or inline → referencing entity
//!
//! Plain symbolic links do not constrain evaluation order. They are recorded as
//! mentions so reverse lookups still find them.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::{
    algo::tarjan_scc,
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
    Direction,
};
use serde::{Deserialize, Serialize};

use crate::properties::EntityKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    Supersedes,
    DerivesFrom,
    FieldReference,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: EntityKey,
    pub to: EntityKey,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<EntityKey, EdgeKind>,
    nodes: BTreeMap<EntityKey, NodeIndex>,
    mentions: BTreeMap<EntityKey, BTreeSet<EntityKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&mut self, key: EntityKey) {
        if !self.nodes.contains_key(&key) {
            let index = self.graph.add_node(key.clone());
            self.nodes.insert(key, index);
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Add an edge between two known entities. Repeated edges of the same kind are
    /// kept once.
    pub fn add_edge(&mut self, from: &EntityKey, to: &EntityKey, kind: EdgeKind) -> bool {
        let (Some(a), Some(b)) = (self.nodes.get(from), self.nodes.get(to)) else {
            return false;
        };
        let exists = self
            .graph
            .edges_connecting(*a, *b)
            .any(|edge| *edge.weight() == kind);
        if !exists {
            self.graph.add_edge(*a, *b, kind);
        }
        true
    }

    /// Record that `referrer` links to `target` without needing its value.
    pub fn add_mention(&mut self, target: &EntityKey, referrer: &EntityKey) {
        self.mentions
            .entry(target.clone())
            .or_default()
            .insert(referrer.clone());
    }

    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edge_references()
            .map(|edge| DependencyEdge {
                from: self.graph[edge.source()].clone(),
                to: self.graph[edge.target()].clone(),
                kind: *edge.weight(),
            })
            .collect();
        edges.sort();
        edges
    }

    /// Strongly connected components that form cycles (including self loops), each
    /// sorted, in source order of their first member.
    pub fn cycles(&self) -> Vec<Vec<EntityKey>> {
        let mut cycles: Vec<Vec<EntityKey>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .map(|ix| self.graph.contains_edge(*ix, *ix))
                        .unwrap_or(false)
            })
            .map(|component| {
                let mut keys: Vec<EntityKey> =
                    component.into_iter().map(|ix| self.graph[ix].clone()).collect();
                keys.sort();
                keys
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Stable topological order of every entity not in `excluded`. Among entities
    /// whose dependencies are satisfied, the earliest in source order goes first.
    /// Edges leaving excluded entities do not hold anything back.
    pub fn topological_order(&self, excluded: &BTreeSet<EntityKey>) -> Vec<EntityKey> {
        let mut in_degree: BTreeMap<&EntityKey, usize> = BTreeMap::new();
        for (key, index) in &self.nodes {
            if excluded.contains(key) {
                continue;
            }
            let blocking = self
                .graph
                .edges_directed(*index, Direction::Incoming)
                .filter(|edge| !excluded.contains(&self.graph[edge.source()]))
                .count();
            in_degree.insert(key, blocking);
        }

        let mut ready: BTreeSet<&EntityKey> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(key) = ready.pop_first() {
            order.push(key.clone());
            let index = self.nodes[key];
            for edge in self.graph.edges_directed(index, Direction::Outgoing) {
                let next = &self.graph[edge.target()];
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        // only reachable when a cycle was not excluded; keep source order
        if order.len() < in_degree.len() {
            let placed: BTreeSet<EntityKey> = order.iter().cloned().collect();
            order.extend(
                in_degree
                    .keys()
                    .filter(|key| !placed.contains(**key))
                    .map(|key| (*key).clone()),
            );
        }
        order
    }

    /// Entities that depend on or mention `key`, with the edge kind when there is
    /// a dependency edge.
    pub fn referrers(&self, key: &EntityKey) -> BTreeSet<(EntityKey, Option<EdgeKind>)> {
        let mut found = BTreeSet::new();
        if let Some(index) = self.nodes.get(key) {
            for edge in self.graph.edges_directed(*index, Direction::Outgoing) {
                found.insert((self.graph[edge.target()].clone(), Some(*edge.weight())));
            }
        }
        if let Some(mentions) = self.mentions.get(key) {
            found.extend(mentions.iter().map(|referrer| (referrer.clone(), None)));
        }
        found
    }
}

/// A `former` target claimed by more than one successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    pub target: EntityKey,
    pub kept: EntityKey,
    pub excluded: Vec<EntityKey>,
}

/// The `former` chains, with forks cut so every chain is linear.
#[derive(Debug, Clone, Default)]
pub struct EvolutionIndex {
    former: BTreeMap<EntityKey, EntityKey>,
    successor: BTreeMap<EntityKey, EntityKey>,
}

impl EvolutionIndex {
    /// Build from `(entity, former target)` pairs. For a target claimed several
    /// times, the successor first in source order keeps the link and the others
    /// are reported in a [`Fork`].
    pub fn build(links: impl IntoIterator<Item = (EntityKey, EntityKey)>) -> (Self, Vec<Fork>) {
        let mut claims: BTreeMap<EntityKey, BTreeSet<EntityKey>> = BTreeMap::new();
        for (child, target) in links {
            if child != target {
                claims.entry(target).or_default().insert(child);
            }
        }
        let mut index = EvolutionIndex::default();
        let mut forks = vec![];
        for (target, children) in claims {
            let mut children = children.into_iter();
            let Some(kept) = children.next() else {
                continue;
            };
            let excluded: Vec<EntityKey> = children.collect();
            index.former.insert(kept.clone(), target.clone());
            index.successor.insert(target.clone(), kept.clone());
            if !excluded.is_empty() {
                forks.push(Fork {
                    target,
                    kept,
                    excluded,
                });
            }
        }
        (index, forks)
    }

    pub fn former_of(&self, key: &EntityKey) -> Option<&EntityKey> {
        self.former.get(key)
    }

    pub fn successor_of(&self, key: &EntityKey) -> Option<&EntityKey> {
        self.successor.get(key)
    }

    /// Latest version in `key`'s chain.
    pub fn tip(&self, key: &EntityKey) -> EntityKey {
        Self::follow(&self.successor, key)
    }

    /// Oldest version in `key`'s chain. Identifies the family.
    pub fn root(&self, key: &EntityKey) -> EntityKey {
        Self::follow(&self.former, key)
    }

    fn follow(links: &BTreeMap<EntityKey, EntityKey>, start: &EntityKey) -> EntityKey {
        let mut seen = BTreeSet::new();
        let mut current = start;
        seen.insert(current);
        while let Some(next) = links.get(current) {
            if !seen.insert(next) {
                // cyclic chain: the cycle detector reports it
                return start.clone();
            }
            current = next;
        }
        current.clone()
    }
}

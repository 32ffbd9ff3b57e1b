//! Modman Graph - Dependency ordering
//!
//! Orders nodes so that every node comes after all nodes it requires. Used
//! for module dependencies, deployment dependencies and the start order of
//! services inside a module.
//!
//! Requirements naming nodes that are not part of the map are treated as
//! satisfied elsewhere and ignored.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Display;
use thiserror::Error;

/// The graph contains at least one cycle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected among: {}", .nodes.join(", "))]
pub struct CycleError {
    /// Nodes that could not be ordered
    pub nodes: Vec<String>,
}

/// Topologically sort `nodes`, where each entry maps a node to the set of
/// nodes it requires.
///
/// No order between independent nodes is guaranteed.
pub fn sort<K>(nodes: &BTreeMap<K, BTreeSet<K>>) -> Result<Vec<K>, CycleError>
where
    K: Ord + Clone + Display,
{
    if nodes.len() <= 1 {
        return Ok(nodes.keys().cloned().collect());
    }

    let mut pending: BTreeMap<&K, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&K, Vec<&K>> = BTreeMap::new();

    for (node, reqs) in nodes {
        let known = reqs.iter().filter(|r| nodes.contains_key(*r));
        let mut count = 0;
        for req in known {
            dependents.entry(req).or_default().push(node);
            count += 1;
        }
        pending.insert(node, count);
    }

    let mut ready: VecDeque<&K> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut ordered = Vec::with_capacity(nodes.len());

    while let Some(node) = ready.pop_front() {
        ordered.push(node.clone());
        for dependent in dependents.get(node).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    if ordered.len() < nodes.len() {
        return Err(CycleError {
            nodes: pending
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(node, _)| node.to_string())
                .collect(),
        });
    }

    Ok(ordered)
}

/// Dependents-first order: the exact reverse of [`sort`]
pub fn sort_reverse<K>(nodes: &BTreeMap<K, BTreeSet<K>>) -> Result<Vec<K>, CycleError>
where
    K: Ord + Clone + Display,
{
    let mut ordered = sort(nodes)?;
    ordered.reverse();
    Ok(ordered)
}

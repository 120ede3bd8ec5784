//! Model dependency graph.
//!
//! Build-once, read-many. Nodes are dense integer ids with parallel
//! upstream/downstream adjacency arrays and a name→id map, so transitive
//! closures and topological order reduce to integer walks. Topological
//! order breaks ties lexicographically on model name, which keeps plans
//! reproducible across runs.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::errors::CoreError;
use crate::model::definition::ModelDefinition;

/// Immutable dependency DAG over a set of models. An edge `u → v` means
/// "v depends on u".
#[derive(Clone, Debug)]
pub struct ModelDag {
    names: Vec<String>,
    index: BTreeMap<String, usize>,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
    depth: Vec<u32>,
    topo: Vec<usize>,
}

/// Construct a DAG from loaded model definitions.
///
/// Rejects dependencies on models absent from the set and rejects cycles
/// with an error naming the cycle.
pub fn build_dag(models: &[ModelDefinition]) -> Result<ModelDag, CoreError> {
    let mut names: Vec<String> = models.iter().map(|m| m.name.clone()).collect();
    names.sort();
    let index: BTreeMap<String, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect();

    let n = names.len();
    let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];

    for model in models {
        let node = index[&model.name];
        for dependency in &model.dependencies {
            let Some(&dep_node) = index.get(dependency) else {
                return Err(CoreError::Validation(format!(
                    "Model `{}` depends on unknown model `{dependency}`",
                    model.name
                )));
            };
            upstream[node].push(dep_node);
            downstream[dep_node].push(node);
        }
    }
    for edges in upstream.iter_mut().chain(downstream.iter_mut()) {
        edges.sort_unstable();
        edges.dedup();
    }

    // Kahn's algorithm with a min-heap keyed on node id; ids were assigned
    // in sorted name order, so equal-depth nodes pop lexicographically.
    let mut remaining: Vec<usize> = upstream.iter().map(|e| e.len()).collect();
    let mut ready: BinaryHeap<std::cmp::Reverse<usize>> = (0..n)
        .filter(|&i| remaining[i] == 0)
        .map(std::cmp::Reverse)
        .collect();

    let mut topo = Vec::with_capacity(n);
    let mut depth = vec![0u32; n];
    while let Some(std::cmp::Reverse(node)) = ready.pop() {
        topo.push(node);
        for &next in &downstream[node] {
            depth[next] = depth[next].max(depth[node] + 1);
            remaining[next] -= 1;
            if remaining[next] == 0 {
                ready.push(std::cmp::Reverse(next));
            }
        }
    }

    if topo.len() != n {
        let cycle = describe_cycle(&names, &upstream, &remaining);
        return Err(CoreError::CyclicGraph(cycle));
    }

    Ok(ModelDag {
        names,
        index,
        upstream,
        downstream,
        depth,
        topo,
    })
}

/// Walk upstream edges among unresolved nodes until one repeats, producing a
/// human-readable cycle description.
fn describe_cycle(names: &[String], upstream: &[Vec<usize>], remaining: &[usize]) -> String {
    let in_cycle: BTreeSet<usize> = remaining
        .iter()
        .enumerate()
        .filter(|&(_, &r)| r > 0)
        .map(|(i, _)| i)
        .collect();

    let Some(&start) = in_cycle.iter().next() else {
        return "unknown cycle".to_string();
    };

    let mut path = vec![start];
    let mut seen = BTreeSet::from([start]);
    let mut current = start;
    loop {
        let Some(&next) = upstream[current].iter().find(|u| in_cycle.contains(u)) else {
            break;
        };
        if !seen.insert(next) {
            path.push(next);
            let loop_start = path.iter().position(|&p| p == next).unwrap_or(0);
            return path[loop_start..]
                .iter()
                .rev()
                .map(|&i| names[i].as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
        }
        path.push(next);
        current = next;
    }
    "unknown cycle".to_string()
}

impl ModelDag {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Model names in deterministic topological order.
    pub fn topological_order(&self) -> Vec<String> {
        self.topo.iter().map(|&i| self.names[i].clone()).collect()
    }

    /// Longest path from any source to the node. Used by the planner as the
    /// step's parallel group.
    pub fn depth(&self, name: &str) -> Option<u32> {
        self.index.get(name).map(|&i| self.depth[i])
    }

    /// Direct upstream dependencies of a node.
    pub fn upstream(&self, name: &str) -> Vec<String> {
        self.index
            .get(name)
            .map(|&i| {
                self.upstream[i]
                    .iter()
                    .map(|&u| self.names[u].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Transitive closure of everything the node depends on.
    pub fn upstream_closure(&self, name: &str) -> BTreeSet<String> {
        self.closure(name, &self.upstream)
    }

    /// Transitive closure of everything that depends on the node.
    pub fn downstream_closure(&self, name: &str) -> BTreeSet<String> {
        self.closure(name, &self.downstream)
    }

    fn closure(&self, name: &str, edges: &[Vec<usize>]) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let Some(&start) = self.index.get(name) else {
            return result;
        };
        let mut stack = edges[start].clone();
        let mut visited = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            result.insert(self.names[node].clone());
            stack.extend(edges[node].iter().copied());
        }
        result
    }
}

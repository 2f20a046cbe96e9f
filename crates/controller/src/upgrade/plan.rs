//! Topology-aware commit planning.
//!
//! Committing reboots nodes, so at most one hop-disjoint neighborhood goes
//! down at a time: a commit batch may not contain two wirelessly adjacent
//! nodes, and may not contain a node whose reboot would partition the mesh
//! (an articulation point of the alive wireless graph).

use std::collections::{BTreeMap, BTreeSet};

use lattice_topology::{LinkType, TopologyView};

/// Wireless adjacency over nodes with assigned MACs, alive links only.
fn wireless_adjacency(topology: &TopologyView) -> BTreeMap<String, BTreeSet<String>> {
    let mut adj: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for node in topology.all_nodes() {
        adj.entry(node.name.clone()).or_default();
    }
    for link in topology.all_links() {
        if link.link_type != LinkType::Wireless || !link.is_alive {
            continue;
        }
        adj.entry(link.a_node_name.clone())
            .or_default()
            .insert(link.z_node_name.clone());
        adj.entry(link.z_node_name.clone())
            .or_default()
            .insert(link.a_node_name.clone());
    }
    adj
}

/// Articulation points of an undirected graph (iterative Tarjan lowlink).
fn articulation_points(adj: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
    let nodes: Vec<&String> = adj.keys().collect();
    let index: BTreeMap<&String, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let n = nodes.len();
    let mut disc = vec![usize::MAX; n];
    let mut low = vec![0usize; n];
    let mut parent = vec![usize::MAX; n];
    let mut is_cut = vec![false; n];
    let mut timer = 0usize;

    for start in 0..n {
        if disc[start] != usize::MAX {
            continue;
        }
        // (node, neighbor iterator position) emulated with an explicit stack
        let mut stack: Vec<(usize, Vec<usize>, usize)> = Vec::new();
        let neighbors = |u: usize| -> Vec<usize> {
            adj[nodes[u]]
                .iter()
                .filter_map(|nb| index.get(&nb).copied())
                .collect()
        };
        disc[start] = timer;
        low[start] = timer;
        timer += 1;
        stack.push((start, neighbors(start), 0));
        let mut root_children = 0usize;

        while !stack.is_empty() {
            let (u, next_v) = {
                let (u, nbrs, i) = stack.last_mut().expect("stack non-empty");
                if *i < nbrs.len() {
                    let v = nbrs[*i];
                    *i += 1;
                    (*u, Some(v))
                } else {
                    (*u, None)
                }
            };
            match next_v {
                Some(v) if disc[v] == usize::MAX => {
                    parent[v] = u;
                    if u == start {
                        root_children += 1;
                    }
                    disc[v] = timer;
                    low[v] = timer;
                    timer += 1;
                    stack.push((v, neighbors(v), 0));
                }
                Some(v) => {
                    if v != parent[u] {
                        low[u] = low[u].min(disc[v]);
                    }
                }
                None => {
                    stack.pop();
                    if let Some((p, _, _)) = stack.last() {
                        let p = *p;
                        low[p] = low[p].min(low[u]);
                        if p != start && low[u] >= disc[p] {
                            is_cut[p] = true;
                        }
                    }
                }
            }
        }
        if root_children > 1 {
            is_cut[start] = true;
        }
    }

    nodes
        .into_iter()
        .enumerate()
        .filter(|(i, _)| is_cut[*i])
        .map(|(_, n)| n.clone())
        .collect()
}

/// Greedily pick up to `limit` commit candidates from `pending`: no two
/// picked nodes wirelessly adjacent, and no pick is the sole path between
/// two other nodes. Stable order (sorted by name) keeps batches
/// deterministic. May return empty when every pending node is load-bearing;
/// the caller handles that degradation.
pub fn commit_candidates(
    topology: &TopologyView,
    pending: &BTreeSet<String>,
    limit: usize,
) -> BTreeSet<String> {
    let adj = wireless_adjacency(topology);
    let cut_vertices = articulation_points(&adj);

    let mut picked: BTreeSet<String> = BTreeSet::new();
    for name in pending {
        if limit > 0 && picked.len() >= limit {
            break;
        }
        if cut_vertices.contains(name) {
            continue;
        }
        let adjacent_to_picked = adj
            .get(name)
            .map(|nbrs| nbrs.iter().any(|nb| picked.contains(nb)))
            .unwrap_or(false);
        if adjacent_to_picked {
            continue;
        }
        picked.insert(name.clone());
    }
    picked
}

/// Full commit plan: repeatedly select candidate batches until every node
/// is scheduled. Used by the plan-preview operation.
pub fn commit_plan(
    topology: &TopologyView,
    limit: i64,
    exclude: &[String],
) -> Vec<Vec<String>> {
    let mut remaining: BTreeSet<String> = topology
        .all_nodes()
        .filter(|n| n.mac_addr.is_some() && !exclude.contains(&n.name))
        .map(|n| n.name.clone())
        .collect();
    let mut batches = Vec::new();
    while !remaining.is_empty() {
        let batch = if limit < 0 {
            remaining.clone()
        } else {
            let picked = commit_candidates(topology, &remaining, limit.max(0) as usize);
            if picked.is_empty() {
                // No routable selection: everything left goes at once.
                remaining.clone()
            } else {
                picked
            }
        };
        for name in &batch {
            remaining.remove(name);
        }
        batches.push(batch.into_iter().collect());
    }
    batches
}

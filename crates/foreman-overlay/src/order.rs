use std::collections::HashMap;

use foreman_core::Checkpoint;

/// Topological order over a checkpoint DAG, returned as indices into the
/// input slice.
///
/// Two edge sources: consecutive checkpoints of the same stream (earlier
/// before later, in discovery order) and parent-commit pointers into other
/// checkpoints. Replay order is the load-bearing invariant of the overlay, so
/// ties break deterministically by discovery order. A lineage cycle should
/// not happen; when it does, the remainder degrades to discovery order
/// instead of aborting the batch.
pub fn topological_order(checkpoints: &[Checkpoint]) -> Vec<usize> {
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); checkpoints.len()];
    let mut indegree: Vec<usize> = vec![0; checkpoints.len()];

    fn add_edge(
        successors: &mut [Vec<usize>],
        indegree: &mut [usize],
        from: usize,
        to: usize,
    ) {
        if from != to && !successors[from].contains(&to) {
            successors[from].push(to);
            indegree[to] += 1;
        }
    }

    let mut last_in_stream: HashMap<&str, usize> = HashMap::new();
    for (index, checkpoint) in checkpoints.iter().enumerate() {
        if let Some(previous) = last_in_stream.insert(checkpoint.stream_id.as_str(), index) {
            add_edge(&mut successors, &mut indegree, previous, index);
        }
    }

    let mut by_commit: HashMap<&str, usize> = HashMap::new();
    for (index, checkpoint) in checkpoints.iter().enumerate() {
        by_commit.entry(checkpoint.commit_sha.as_str()).or_insert(index);
    }
    for (index, checkpoint) in checkpoints.iter().enumerate() {
        if let Some(parent) = checkpoint.parent_commit.as_deref() {
            if let Some(&parent_index) = by_commit.get(parent) {
                add_edge(&mut successors, &mut indegree, parent_index, index);
            }
        }
    }

    let mut ready: std::collections::BinaryHeap<std::cmp::Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| std::cmp::Reverse(index))
        .collect();

    let mut order = Vec::with_capacity(checkpoints.len());
    let mut placed = vec![false; checkpoints.len()];
    while let Some(std::cmp::Reverse(index)) = ready.pop() {
        order.push(index);
        placed[index] = true;
        for &next in &successors[index] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(std::cmp::Reverse(next));
            }
        }
    }

    if order.len() < checkpoints.len() {
        tracing::warn!(
            unplaced = checkpoints.len() - order.len(),
            "checkpoint lineage contains a cycle; replaying remainder in discovery order"
        );
        for (index, placed) in placed.iter().enumerate() {
            if !placed {
                order.push(index);
            }
        }
    }

    order
}

//! Column ordering for rendered branches.
//!
//! Branches that spawned other branches are kept near the middle of the
//! layout so copy and merge edges stay short.

use std::cmp::Reverse;
use std::collections::VecDeque;

use tracing::debug;

use crate::models::BranchEntity;

/// Order `branches` for display.
///
/// The result holds every input branch exactly once and depends only on the
/// input order.
pub fn optimize(branches: &[BranchEntity]) -> Vec<&BranchEntity> {
    let mut sorted: Vec<&BranchEntity> = branches.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let children = forest(&sorted);

    let mut sources: Vec<usize> = (0..sorted.len()).filter(|&i| !children[i].is_empty()).collect();
    sources.sort_by_key(|&i| Reverse(children[i].len()));

    let mut placement = Placement::new(sorted.len());
    for &i in &sources {
        placement.place(i);
    }
    for &i in &sources {
        for &child in &children[i] {
            placement.place(child);
        }
    }
    for i in 0..sorted.len() {
        placement.place(i);
    }

    let order: Vec<&BranchEntity> = placement.order.into_iter().map(|i| sorted[i]).collect();
    debug!(
        branches = order.len(),
        sources = sources.len(),
        "optimized branch placement"
    );
    order
}

/// Children of each branch, by index into `sorted`. Only rendered sources
/// count as parents.
fn forest(sorted: &[&BranchEntity]) -> Vec<Vec<usize>> {
    let mut children = vec![Vec::new(); sorted.len()];
    for (i, branch) in sorted.iter().enumerate() {
        let Some(source) = &branch.source else {
            continue;
        };
        let candidates: Vec<usize> = sorted
            .iter()
            .enumerate()
            .filter(|(j, b)| *j != i && b.path == source.path)
            .map(|(j, _)| j)
            .collect();
        let parent = candidates
            .iter()
            .copied()
            .find(|&j| sorted[j].contains(source.revision))
            .or_else(|| candidates.first().copied());
        if let Some(parent) = parent {
            children[parent].push(i);
        }
    }
    children
}

/// Insertion cursor alternating between both ends of the layout.
struct Placement {
    order: VecDeque<usize>,
    placed: Vec<bool>,
    front: bool,
}

impl Placement {
    fn new(len: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(len),
            placed: vec![false; len],
            front: true,
        }
    }

    fn place(&mut self, i: usize) {
        if self.placed[i] {
            return;
        }
        self.placed[i] = true;
        if self.front {
            self.order.push_front(i);
        } else {
            self.order.push_back(i);
        }
        self.front = !self.front;
    }
}

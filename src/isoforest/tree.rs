/// Isolation tree, arena form. This is what training builds and what gets packed into a
/// CompressedTree. Scoring never needs it.
use super::{split::SplitCriteria, LeafHit, SplitGenerator};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Split {
        criteria: SplitCriteria,
        left: usize,
        right: usize,
        depth: usize,
        n_rows: usize,
    },
    // 1 row means isolated. More than 1 means the height limit or a zero-split stopped it.
    Leaf {
        n_rows: usize,
    },
}

impl Node {
    pub fn n_rows(&self) -> usize {
        match self {
            Node::Split { n_rows, .. } => *n_rows,
            Node::Leaf { n_rows } => *n_rows,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}

/// What happened while growing one tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBuildStats {
    pub isolated_points: usize,
    pub not_isolated_points: usize,
    pub zero_splits: usize,
    pub leaves: usize,
    pub depth: usize,
}

impl TreeBuildStats {
    fn record_leaf(&mut self, n_rows: usize, depth: usize, zero_split: bool) {
        self.leaves += 1;
        self.depth = self.depth.max(depth);
        if n_rows <= 1 {
            self.isolated_points += n_rows;
        } else {
            self.not_isolated_points += n_rows;
        }
        if zero_split {
            self.zero_splits += 1;
        }
    }
}

// A node still to be grown: rows[start..end] at depth. parent is set for right children,
// whose index is only known once the left subtree is done.
struct Pending {
    start: usize,
    end: usize,
    depth: usize,
    parent: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct IsolationTree {
    dim: usize,
    height_limit: usize,
    nodes: Vec<Node>,
    stats: TreeBuildStats,
}

impl IsolationTree {
    /// Grows a tree over rows. rows is reordered in place while partitioning.
    /// Nodes are laid out in pre-order: root at 0, a split's left child right after it.
    pub fn build<R: Rng>(
        rows: &mut [&[f64]],
        generator: SplitGenerator,
        height_limit: usize,
        rng: &mut R,
    ) -> Self {
        let mut nodes: Vec<Node> = Vec::with_capacity(2 * rows.len().max(1) - 1);
        let mut stats = TreeBuildStats::default();
        let mut pending = vec![Pending {
            start: 0,
            end: rows.len(),
            depth: 0,
            parent: None,
        }];

        while let Some(task) = pending.pop() {
            let idx = nodes.len();
            if let Some(Node::Split { right, .. }) = task.parent.and_then(|p| nodes.get_mut(p)) {
                *right = idx;
            }

            let subset = &mut rows[task.start..task.end];
            let n = subset.len();
            if n <= 1 || task.depth >= height_limit {
                stats.record_leaf(n, task.depth, false);
                nodes.push(Node::Leaf { n_rows: n });
                continue;
            }

            let criteria = generator.generate(subset, rng);
            // Left rows end up in front. First index of a right row.
            let split_idx = itertools::partition(subset.iter_mut(), |row| criteria.goes_left(row));
            if split_idx == 0 || split_idx == n {
                // The hyperplane missed the data. Happens when the rows are (nearly) identical.
                stats.record_leaf(n, task.depth, true);
                nodes.push(Node::Leaf { n_rows: n });
                continue;
            }

            nodes.push(Node::Split {
                criteria,
                left: idx + 1,
                right: usize::MAX, // filled when the right child is popped
                depth: task.depth,
                n_rows: n,
            });
            let mid = task.start + split_idx;
            pending.push(Pending {
                start: mid,
                end: task.end,
                depth: task.depth + 1,
                parent: Some(idx),
            });
            pending.push(Pending {
                start: task.start,
                end: mid,
                depth: task.depth + 1,
                parent: None,
            });
        }

        IsolationTree {
            dim: generator.dim(),
            height_limit,
            nodes,
            stats,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn height_limit(&self) -> usize {
        self.height_limit
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> &TreeBuildStats {
        &self.stats
    }

    /// Index of the leaf the row falls into, and the row's depth there.
    pub fn find_leaf(&self, row: &[f64]) -> (usize, usize) {
        let mut idx = 0;
        let mut depth = 0;
        while let Node::Split {
            criteria,
            left,
            right,
            ..
        } = &self.nodes[idx]
        {
            idx = if criteria.goes_left(row) { *left } else { *right };
            depth += 1;
        }
        (idx, depth)
    }

    pub fn leaf_hit(&self, row: &[f64]) -> LeafHit {
        let (idx, depth) = self.find_leaf(row);
        LeafHit {
            depth,
            n_rows: self.nodes[idx].n_rows(),
        }
    }

    /// Training-time path length, used to check the compressed walker.
    pub fn path_length(&self, row: &[f64]) -> f64 {
        self.leaf_hit(row).path_length()
    }
}

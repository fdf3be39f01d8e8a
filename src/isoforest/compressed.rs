/// Byte-packed isolation tree. This is the only form that is persisted and scored.
///
/// Layout, all little endian:
///     header: dim u32 | n_nodes u32
///     leaf:   0u8 | n_rows u32
///     split:  1u8 | depth u32 | right u32 | normal f64 x dim | intercept f64 x dim
/// Nodes are in pre-order. A split's left child starts right after it, `right` is the absolute
/// byte offset of its right child.
use super::{goes_left, project, tree::Node, IsoForestError, IsolationTree, LeafHit};
use serde::{Deserialize, Serialize};

const HEADER_LEN: usize = 8;
const LEAF_TAG: u8 = 0;
const SPLIT_TAG: u8 = 1;
const LEAF_LEN: usize = 1 + 4;
const SPLIT_FIXED_LEN: usize = 1 + 4 + 4;

#[inline(always)]
fn split_len(dim: usize) -> usize {
    SPLIT_FIXED_LEN + 16 * dim
}

fn corrupt(msg: &str, pos: usize) -> IsoForestError {
    IsoForestError::CorruptTree(format!("{} at byte {}.", msg, pos))
}

#[inline(always)]
fn read_u32(bytes: &[u8], pos: usize) -> Result<usize, IsoForestError> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(
        bytes
            .get(pos..pos + 4)
            .ok_or_else(|| corrupt("Unexpected end of buffer", pos))?,
    );
    Ok(u32::from_le_bytes(buf) as usize)
}

// Every u32 field holds a count or an offset of a tree grown from a sample, far below u32::MAX.
#[inline(always)]
fn le_u32(x: usize) -> [u8; 4] {
    debug_assert!(x <= u32::MAX as usize, "{} does not fit in a u32 field", x);
    (x as u32).to_le_bytes()
}

// Chunks are always 8 bytes, coming from chunks_exact(8).
#[inline(always)]
fn le_f64(chunk: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(chunk);
    f64::from_le_bytes(buf)
}

#[inline(always)]
fn le_f64s(bytes: &[u8]) -> impl Iterator<Item = f64> + '_ {
    bytes.chunks_exact(8).map(le_f64)
}

enum PackedNode<'a> {
    Split {
        right: usize,
        normal: &'a [u8],
        intercept: &'a [u8],
    },
    Leaf {
        n_rows: usize,
    },
}

/// Reads the node starting at pos. Returns the node and its length in bytes.
#[inline]
fn read_node(bytes: &[u8], pos: usize, dim: usize) -> Result<(PackedNode<'_>, usize), IsoForestError> {
    match bytes.get(pos) {
        Some(&LEAF_TAG) => {
            let n_rows = read_u32(bytes, pos + 1)?;
            Ok((PackedNode::Leaf { n_rows }, LEAF_LEN))
        }
        Some(&SPLIT_TAG) => {
            let len = split_len(dim);
            let right = read_u32(bytes, pos + 5)?;
            let vecs = bytes
                .get(pos + SPLIT_FIXED_LEN..pos + len)
                .ok_or_else(|| corrupt("Truncated split node", pos))?;
            let (normal, intercept) = vecs.split_at(8 * dim);
            Ok((
                PackedNode::Split {
                    right,
                    normal,
                    intercept,
                },
                len,
            ))
        }
        Some(_) => Err(corrupt("Unknown node tag", pos)),
        None => Err(corrupt("Unexpected end of buffer", pos)),
    }
}

fn read_header(bytes: &[u8]) -> Result<(usize, usize), IsoForestError> {
    Ok((read_u32(bytes, 0)?, read_u32(bytes, 4)?))
}

/// Walks the packed tree with row, and returns the depth and size of the leaf it reaches.
/// Takes the same decision as the in-memory tree: left iff (row - intercept) . normal < 0.
pub fn decode_and_walk(bytes: &[u8], row: &[f64]) -> Result<LeafHit, IsoForestError> {
    let (dim, _) = read_header(bytes)?;
    if row.len() != dim {
        return Err(IsoForestError::DimensionMismatch {
            expected: dim,
            got: row.len(),
        });
    }
    let mut pos = HEADER_LEN;
    let mut depth = 0;
    loop {
        match read_node(bytes, pos, dim)? {
            (PackedNode::Leaf { n_rows }, _) => return Ok(LeafHit { depth, n_rows }),
            (
                PackedNode::Split {
                    right,
                    normal,
                    intercept,
                },
                len,
            ) => {
                // Children always come after their parent. This also rules out cycles.
                if right <= pos {
                    return Err(corrupt("Right child before its parent", pos));
                }
                let z = project(row, le_f64s(normal), le_f64s(intercept));
                pos = if goes_left(z) { pos + len } else { right };
                depth += 1;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct CompressedTree {
    bytes: Vec<u8>,
    dim: usize,
    n_nodes: usize,
}

impl CompressedTree {
    /// Packs an arena tree. The arena is already in pre-order, so this is one linear pass
    /// for the offsets and one for the bytes.
    pub fn encode(tree: &IsolationTree) -> Self {
        let dim = tree.dim();
        let nodes = tree.nodes();

        let mut offsets = Vec::with_capacity(nodes.len());
        let mut total = HEADER_LEN;
        for node in nodes.iter() {
            offsets.push(total);
            total += if node.is_leaf() {
                LEAF_LEN
            } else {
                split_len(dim)
            };
        }

        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&le_u32(dim));
        bytes.extend_from_slice(&le_u32(nodes.len()));
        for node in nodes.iter() {
            match node {
                Node::Leaf { n_rows } => {
                    bytes.push(LEAF_TAG);
                    bytes.extend_from_slice(&le_u32(*n_rows));
                }
                Node::Split {
                    criteria,
                    right,
                    depth,
                    ..
                } => {
                    bytes.push(SPLIT_TAG);
                    bytes.extend_from_slice(&le_u32(*depth));
                    bytes.extend_from_slice(&le_u32(offsets[*right]));
                    for n in criteria.normal.iter() {
                        bytes.extend_from_slice(&n.to_le_bytes());
                    }
                    for p in criteria.intercept.iter() {
                        bytes.extend_from_slice(&p.to_le_bytes());
                    }
                }
            }
        }
        debug_assert_eq!(bytes.len(), total);

        CompressedTree {
            bytes,
            dim,
            n_nodes: nodes.len(),
        }
    }

    /// Takes ownership of a packed tree after checking that it is a well formed pre-order
    /// tree: known tags, no truncation, every right offset pointing at the node that follows
    /// the left subtree, and the node count in the header.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, IsoForestError> {
        let (dim, n_nodes) = read_header(&bytes)?;
        // Right offsets still expected, innermost split on top.
        let mut expected_right: Vec<usize> = Vec::new();
        let mut pos = HEADER_LEN;
        let mut count = 0usize;
        let mut after_split = false;
        while pos < bytes.len() {
            if count > 0 && !after_split {
                // Previous node was a leaf, so this must be the right child of the innermost
                // split whose left subtree just ended.
                match expected_right.pop() {
                    Some(r) if r == pos => {}
                    _ => return Err(corrupt("Misplaced right child", pos)),
                }
            }
            let (node, len) = read_node(&bytes, pos, dim)?;
            after_split = match node {
                PackedNode::Split { right, .. } => {
                    if right <= pos {
                        return Err(corrupt("Right child before its parent", pos));
                    }
                    expected_right.push(right);
                    true
                }
                PackedNode::Leaf { .. } => false,
            };
            pos += len;
            count += 1;
        }
        if count == 0 {
            return Err(corrupt("No root node", pos));
        }
        if after_split || !expected_right.is_empty() {
            return Err(corrupt("Missing children", pos));
        }
        if count != n_nodes {
            return Err(IsoForestError::CorruptTree(format!(
                "Header says {} nodes but found {}.",
                n_nodes, count
            )));
        }
        Ok(CompressedTree {
            bytes,
            dim,
            n_nodes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn leaf_hit(&self, row: &[f64]) -> Result<LeafHit, IsoForestError> {
        decode_and_walk(&self.bytes, row)
    }

    /// Raw depth plus c(n) of the leaf the row reaches.
    pub fn path_length(&self, row: &[f64]) -> Result<f64, IsoForestError> {
        self.leaf_hit(row).map(|hit| hit.path_length())
    }
}

impl From<&IsolationTree> for CompressedTree {
    fn from(tree: &IsolationTree) -> Self {
        CompressedTree::encode(tree)
    }
}

impl TryFrom<Vec<u8>> for CompressedTree {
    type Error = IsoForestError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        CompressedTree::from_bytes(bytes)
    }
}

impl From<CompressedTree> for Vec<u8> {
    fn from(tree: CompressedTree) -> Self {
        tree.bytes
    }
}

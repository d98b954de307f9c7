use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::RegistrationError;

/// Default maximum number of points stored in a leaf.
pub const DEFAULT_LEAF_SIZE: usize = 16;

/// A query result: index into the indexed point set and squared distance to the query.
///
/// Neighbors are ordered by distance, ties broken by index.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    /// Index of the point in the indexed set.
    pub index: usize,
    /// Squared Euclidean distance to the query.
    pub distance_squared: f64,
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_squared
            .total_cmp(&other.distance_squared)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
enum Node {
    // range into `indices`
    Leaf {
        start: u32,
        end: u32,
    },
    // left holds coordinates <= value, right holds coordinates >= value
    Split {
        axis: u8,
        value: f64,
        left: u32,
        right: u32,
    },
}

/// Immutable k-d tree over a snapshot of 3D points.
///
/// Nodes are stored in a flat array and reference their children by index.
/// Each split uses the axis of maximum spread and the median point along it.
/// The tree does not track the cloud it was built from: rebuild it whenever the
/// geometry changes.
#[derive(Debug, Clone)]
pub struct KdTree {
    points: Vec<[f64; 3]>,
    indices: Vec<u32>,
    nodes: Vec<Node>,
    leaf_size: usize,
}

#[inline]
fn distance_squared(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

impl KdTree {
    /// Build a tree with the default leaf size.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::EmptyIndex`] if `points` is empty.
    pub fn new(points: &[[f64; 3]]) -> Result<Self, RegistrationError> {
        Self::with_leaf_size(points, DEFAULT_LEAF_SIZE)
    }

    /// Build a tree whose leaves hold at most `leaf_size` points.
    pub fn with_leaf_size(points: &[[f64; 3]], leaf_size: usize) -> Result<Self, RegistrationError> {
        if points.is_empty() {
            return Err(RegistrationError::EmptyIndex);
        }
        if points.len() > u32::MAX as usize {
            return Err(RegistrationError::InvalidInput(format!(
                "cannot index {} points, the limit is {}",
                points.len(),
                u32::MAX
            )));
        }

        let leaf_size = leaf_size.max(1);
        let mut tree = Self {
            points: points.to_vec(),
            indices: (0..points.len() as u32).collect(),
            nodes: Vec::with_capacity(2 * points.len() / leaf_size + 1),
            leaf_size,
        };
        tree.build(0, points.len());

        Ok(tree)
    }

    fn max_spread_axis(&self, start: usize, end: usize) -> (usize, f64) {
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for &i in &self.indices[start..end] {
            let p = &self.points[i as usize];
            for d in 0..3 {
                lo[d] = lo[d].min(p[d]);
                hi[d] = hi[d].max(p[d]);
            }
        }
        (0..3)
            .map(|d| (d, hi[d] - lo[d]))
            .fold((0, f64::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            })
    }

    fn build(&mut self, start: usize, end: usize) -> u32 {
        let node_id = self.nodes.len() as u32;

        let (axis, spread) = self.max_spread_axis(start, end);
        // NaN spread also ends up in a leaf
        if end - start <= self.leaf_size || !(spread > 0.0) {
            self.nodes.push(Node::Leaf {
                start: start as u32,
                end: end as u32,
            });
            return node_id;
        }

        let mid = start + (end - start) / 2;
        let points = &self.points;
        self.indices[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            points[a as usize][axis].total_cmp(&points[b as usize][axis])
        });
        let value = self.points[self.indices[mid] as usize][axis];

        // reserve the slot, children are appended after it
        self.nodes.push(Node::Leaf { start: 0, end: 0 });
        let left = self.build(start, mid);
        let right = self.build(mid, end);
        self.nodes[node_id as usize] = Node::Split {
            axis: axis as u8,
            value,
            left,
            right,
        };

        node_id
    }

    /// Number of indexed points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false: an index cannot be built from an empty set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The indexed points, in their original order.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Number of nodes in the flat node array.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Find the closest point to `query`.
    ///
    /// Returns `None` only when the query is not comparable, e.g. it contains NaN.
    pub fn nearest(&self, query: &[f64; 3]) -> Option<Neighbor> {
        let mut best = Neighbor {
            index: usize::MAX,
            distance_squared: f64::INFINITY,
        };
        self.search_nearest(0, query, &mut best);
        (best.index != usize::MAX).then_some(best)
    }

    /// Find the `k` closest points to `query`, sorted by distance.
    ///
    /// Returns all points when the tree holds fewer than `k`.
    pub fn knn(&self, query: &[f64; 3], k: usize) -> Vec<Neighbor> {
        self.search_bounded(query, k.min(self.len()), f64::INFINITY)
    }

    /// Find every point within `radius` (inclusive) of `query`, sorted by distance.
    pub fn radius(&self, query: &[f64; 3], radius: f64) -> Vec<Neighbor> {
        if !(radius >= 0.0) {
            return Vec::new();
        }
        self.search_bounded(query, self.len(), radius * radius)
    }

    /// Find at most `max_nn` closest points within `radius` of `query`, sorted by distance.
    pub fn hybrid(&self, query: &[f64; 3], radius: f64, max_nn: usize) -> Vec<Neighbor> {
        if !(radius >= 0.0) {
            return Vec::new();
        }
        self.search_bounded(query, max_nn.min(self.len()), radius * radius)
    }

    fn search_bounded(&self, query: &[f64; 3], k: usize, max_distance_squared: f64) -> Vec<Neighbor> {
        if k == 0 {
            return Vec::new();
        }
        let mut heap = BinaryHeap::with_capacity(k.min(1024));
        self.search_heap(0, query, k, max_distance_squared, &mut heap);
        heap.into_sorted_vec()
    }

    fn search_nearest(&self, node: u32, query: &[f64; 3], best: &mut Neighbor) {
        match self.nodes[node as usize] {
            Node::Leaf { start, end } => {
                for &i in &self.indices[start as usize..end as usize] {
                    let candidate = Neighbor {
                        index: i as usize,
                        distance_squared: distance_squared(query, &self.points[i as usize]),
                    };
                    if candidate < *best {
                        *best = candidate;
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis as usize] - value;
                let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.search_nearest(near, query, best);
                if diff * diff <= best.distance_squared {
                    self.search_nearest(far, query, best);
                }
            }
        }
    }

    fn search_heap(
        &self,
        node: u32,
        query: &[f64; 3],
        k: usize,
        max_distance_squared: f64,
        heap: &mut BinaryHeap<Neighbor>,
    ) {
        match self.nodes[node as usize] {
            Node::Leaf { start, end } => {
                for &i in &self.indices[start as usize..end as usize] {
                    let d = distance_squared(query, &self.points[i as usize]);
                    if d > max_distance_squared {
                        continue;
                    }
                    let candidate = Neighbor {
                        index: i as usize,
                        distance_squared: d,
                    };
                    if heap.len() < k {
                        heap.push(candidate);
                    } else if heap.peek().is_some_and(|top| candidate < *top) {
                        heap.pop();
                        heap.push(candidate);
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis as usize] - value;
                let (near, far) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.search_heap(near, query, k, max_distance_squared, heap);

                let bound = match heap.peek() {
                    Some(top) if heap.len() == k => top.distance_squared.min(max_distance_squared),
                    _ => max_distance_squared,
                };
                if diff * diff <= bound {
                    self.search_heap(far, query, k, max_distance_squared, heap);
                }
            }
        }
    }
}

/// Build buffers of both join sides for one window, as collected by one
/// worker.
///
/// Workers append to their own partition without synchronization; once all
/// of them finished a window, the partitions are combined and joined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NestedLoopPartition<K, L, R> {
    left: Vec<(K, L)>,
    right: Vec<(K, R)>,
}

impl<K, L, R> Default for NestedLoopPartition<K, L, R> {
    fn default() -> Self {
        Self {
            left: Vec::new(),
            right: Vec::new(),
        }
    }
}

impl<K, L, R> NestedLoopPartition<K, L, R> {
    pub fn push_left(&mut self, key: K, record: L) {
        self.left.push((key, record));
    }

    pub fn push_right(&mut self, key: K, record: R) {
        self.right.push((key, record));
    }

    /// Number of records on both sides.
    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty()
    }

    /// Concatenates the partitions of all workers.
    pub fn combine<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        let mut combined = Self::default();
        for mut part in parts {
            combined.left.append(&mut part.left);
            combined.right.append(&mut part.right);
        }
        combined
    }
}

impl<K: Eq, L, R> NestedLoopPartition<K, L, R> {
    /// Every pair of left and right records with equal keys.  The whole
    /// left side is scanned for each right record.
    pub fn join(&self) -> impl Iterator<Item = (&K, &L, &R)> {
        self.right.iter().flat_map(move |(right_key, right)| {
            self.left
                .iter()
                .filter(move |(left_key, _)| left_key == right_key)
                .map(move |(key, left)| (key, left, right))
        })
    }
}

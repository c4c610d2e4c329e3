//! Duplicate grouping over step-evidence images.
//!
//! Two passes: a single scan records, for each hash, the first index seen and
//! a `(duplicate, first)` pair for every later hit; a union-find pass then
//! merges transitively-equal pairs so collisions observed across disjoint
//! links still land in one group.

use crate::fingerprint::{Fingerprinter, ImageRef};
use anyhow::Context;
use std::collections::HashMap;

/// Group perceptually identical items by index.
///
/// Output groups are disjoint, each sorted ascending, ordered by their
/// minimum member; singletons (no duplicate partner) are omitted. Identical
/// input order always yields identical output. A fingerprinting failure on
/// any item aborts the whole grouping: silently excluding an item would
/// corrupt duplicate-aware judging downstream.
pub async fn group(
    fingerprinter: &Fingerprinter,
    items: &[ImageRef],
) -> anyhow::Result<Vec<Vec<usize>>> {
    let mut first_by_hash: HashMap<u64, usize> = HashMap::new();
    let mut pairs: Vec<(usize, usize)> = Vec::new();

    for (idx, item) in items.iter().enumerate() {
        let hash = fingerprinter
            .fingerprint(item)
            .await
            .with_context(|| format!("failed to fingerprint item[{}]", idx))?;
        match first_by_hash.get(&hash.0) {
            Some(&first) => pairs.push((idx, first)),
            None => {
                first_by_hash.insert(hash.0, idx);
            }
        }
    }

    Ok(merge_pairs(&pairs))
}

/// Union duplicate pairs into sorted, disjoint groups.
pub fn merge_pairs(pairs: &[(usize, usize)]) -> Vec<Vec<usize>> {
    if pairs.is_empty() {
        return Vec::new();
    }

    let mut uf = UnionFind::default();
    for &(dup, first) in pairs {
        uf.union(first, dup);
    }

    let mut buckets: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut members: Vec<usize> = pairs.iter().flat_map(|&(a, b)| [a, b]).collect();
    members.sort_unstable();
    members.dedup();
    for m in members {
        let root = uf.find(m);
        buckets.entry(root).or_default().push(m);
    }

    let mut groups: Vec<Vec<usize>> = buckets.into_values().collect();
    for g in &mut groups {
        g.sort_unstable();
        g.dedup();
    }
    groups.sort_by_key(|g| g[0]);
    groups
}

#[derive(Default)]
struct UnionFind {
    parent: HashMap<usize, usize>,
}

impl UnionFind {
    fn find(&mut self, x: usize) -> usize {
        let p = *self.parent.entry(x).or_insert(x);
        if p == x {
            return x;
        }
        let root = self.find(p);
        self.parent.insert(x, root);
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(rb, ra);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::test_support::{encode, sample_image};
    use image::ImageFormat;

    fn bytes_ref(seed: u8, format: ImageFormat) -> ImageRef {
        ImageRef::Bytes(encode(&sample_image(seed), format))
    }

    #[tokio::test]
    async fn groups_are_a_disjoint_partition_of_duplicates() {
        let items = vec![
            bytes_ref(1, ImageFormat::Png),
            bytes_ref(2, ImageFormat::Png),
            bytes_ref(1, ImageFormat::Bmp), // same content as 0, other encoding
            bytes_ref(3, ImageFormat::Png),
            bytes_ref(2, ImageFormat::Bmp), // same content as 1
        ];
        let fp = Fingerprinter::default();
        let groups = group(&fp, &items).await.unwrap();
        assert_eq!(groups, vec![vec![0, 2], vec![1, 4]]);

        let mut seen = std::collections::HashSet::new();
        for g in &groups {
            for m in g {
                assert!(seen.insert(*m), "groups must not share a member");
            }
        }
    }

    #[tokio::test]
    async fn identical_input_order_is_deterministic() {
        let items = vec![
            bytes_ref(5, ImageFormat::Png),
            bytes_ref(5, ImageFormat::Png),
            bytes_ref(6, ImageFormat::Png),
            bytes_ref(5, ImageFormat::Bmp),
            bytes_ref(6, ImageFormat::Bmp),
        ];
        let fp = Fingerprinter::default();
        let first = group(&fp, &items).await.unwrap();
        let second = group(&fp, &items).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![vec![0, 1, 3], vec![2, 4]]);
    }

    #[tokio::test]
    async fn fingerprint_failure_aborts_grouping() {
        let items = vec![
            bytes_ref(1, ImageFormat::Png),
            ImageRef::Bytes(vec![0u8; 16]), // undecodable
            bytes_ref(1, ImageFormat::Png),
        ];
        let fp = Fingerprinter::default();
        let err = group(&fp, &items).await.unwrap_err();
        assert!(err.to_string().contains("item[1]"));
    }

    #[tokio::test]
    async fn no_duplicates_yields_no_groups() {
        let items = vec![bytes_ref(1, ImageFormat::Png), bytes_ref(2, ImageFormat::Png)];
        let fp = Fingerprinter::default();
        assert!(group(&fp, &items).await.unwrap().is_empty());
    }

    #[test]
    fn transitive_pairs_merge_into_one_group() {
        // Disjoint pairwise links (1,0) and (2,1) must union into {0,1,2}.
        let groups = merge_pairs(&[(1, 0), (2, 1), (4, 3)]);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4]]);
    }
}

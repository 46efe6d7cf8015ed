//! Brute-force descriptor matching with the distance-ratio test.

use crate::detect::Descriptor;

/// A correspondence between a query descriptor and a train descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointMatch {
    /// Index into the query set.
    pub query: usize,
    /// Index into the train set.
    pub train: usize,
    /// Hamming distance of the winning pair.
    pub distance: u32,
}

/// Match every query descriptor against the train set and keep only matches
/// passing Lowe's ratio test: the best distance must be strictly less than
/// `ratio` times the second-best distance.
///
/// A query with fewer than two train candidates is dropped since the ratio is
/// undefined there. Ambiguous queries (best and second-best equally good)
/// are rejected by the strict comparison.
pub fn match_descriptors(query: &[Descriptor], train: &[Descriptor], ratio: f32) -> Vec<PointMatch> {
    if train.len() < 2 {
        return Vec::new();
    }

    let mut matches = Vec::new();

    for (qi, q) in query.iter().enumerate() {
        let mut best = u32::MAX;
        let mut best_idx = 0usize;
        let mut second = u32::MAX;

        for (ti, t) in train.iter().enumerate() {
            let d = q.hamming(t);
            if d < best {
                second = best;
                best = d;
                best_idx = ti;
            } else if d < second {
                second = d;
            }
        }

        if (best as f32) < ratio * second as f32 {
            matches.push(PointMatch {
                query: qi,
                train: best_idx,
                distance: best,
            });
        }
    }

    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DESCRIPTOR_BYTES;

    fn descriptor(fill: u8) -> Descriptor {
        Descriptor([fill; DESCRIPTOR_BYTES])
    }

    #[test]
    fn test_identical_descriptors_match() {
        let query = vec![descriptor(0b1010_1010)];
        let train = vec![descriptor(0b1010_1010), descriptor(0b0101_0101)];

        let matches = match_descriptors(&query, &train, 0.8);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].query, 0);
        assert_eq!(matches[0].train, 0);
        assert_eq!(matches[0].distance, 0);
    }

    #[test]
    fn test_ratio_rejects_ambiguous_match() {
        // two equally good candidates: best == second-best, must be rejected
        let query = vec![descriptor(0xff)];
        let train = vec![descriptor(0xff), descriptor(0xff), descriptor(0x00)];

        let matches = match_descriptors(&query, &train, 0.8);
        assert!(matches.is_empty());
    }

    #[test]
    fn test_ratio_threshold_boundary() {
        // best = 8 (one byte differs fully), second = 256
        let query = vec![descriptor(0x00)];
        let mut near = [0x00u8; DESCRIPTOR_BYTES];
        near[0] = 0xff;
        let train = vec![Descriptor(near), descriptor(0xff)];

        // 8 < 0.8 * 256 passes; 8 < 0.03 * 256 = 7.68 fails
        assert_eq!(match_descriptors(&query, &train, 0.8).len(), 1);
        assert!(match_descriptors(&query, &train, 0.03).is_empty());
    }

    #[test]
    fn test_single_train_descriptor_yields_nothing() {
        let query = vec![descriptor(0x12)];
        let train = vec![descriptor(0x12)];
        assert!(match_descriptors(&query, &train, 0.8).is_empty());
    }
}

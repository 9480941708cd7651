//! Threshold-vote matching of an unknown embedding against the gallery.

use crate::gallery::Gallery;
use crate::types::{Embedding, Identity};

/// Default match tolerance on Euclidean embedding distance.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Pairwise match flags: `true` where `known[i]` lies within `tolerance`.
///
/// Embeddings from a different model version never match.
pub fn compare_many(known: &[Embedding], unknown: &Embedding, tolerance: f32) -> Vec<bool> {
    known
        .iter()
        .map(|k| k.is_comparable(unknown) && k.distance(unknown) <= tolerance)
        .collect()
}

/// Nearest-neighbour-by-threshold vote classifier.
///
/// Every gallery entry within tolerance casts one vote for its label. The
/// label with most votes wins; ties go to the label seen first in gallery
/// order.
#[derive(Debug, Clone, Copy)]
pub struct VoteMatcher {
    pub tolerance: f32,
}

impl Default for VoteMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl VoteMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }

    pub fn identify(&self, unknown: &Embedding, gallery: &Gallery) -> Identity {
        let matches = compare_many(gallery.encodings(), unknown, self.tolerance);

        // (label, votes) in first-encountered order.
        let mut tally: Vec<(&str, usize)> = Vec::new();
        for (name, _) in gallery
            .names()
            .iter()
            .zip(matches)
            .filter(|(_, matched)| *matched)
        {
            match tally.iter_mut().find(|(label, _)| *label == name.as_str()) {
                Some((_, votes)) => *votes += 1,
                None => tally.push((name.as_str(), 1)),
            }
        }

        // Strictly-greater keeps the earliest label on ties.
        let mut best: Option<(&str, usize)> = None;
        for (label, votes) in tally {
            if best.map_or(true, |(_, top)| votes > top) {
                best = Some((label, votes));
            }
        }

        match best {
            Some((label, _)) => Identity::Known(label.to_string()),
            None => Identity::Unknown,
        }
    }

    pub fn identify_all(&self, unknowns: &[Embedding], gallery: &Gallery) -> Vec<Identity> {
        unknowns.iter().map(|e| self.identify(e, gallery)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn gallery(entries: &[(&str, &[f32])]) -> Gallery {
        let mut g = Gallery::default();
        for (name, values) in entries {
            g.push(name.to_string(), emb(values));
        }
        g
    }

    #[test]
    fn test_compare_many_threshold_is_inclusive() {
        let known = vec![emb(&[0.0, 0.0]), emb(&[0.5, 0.0]), emb(&[0.75, 0.0])];
        let flags = compare_many(&known, &emb(&[0.0, 0.0]), 0.5);
        assert_eq!(flags, vec![true, true, false]);
    }

    #[test]
    fn test_compare_many_rejects_other_model_versions() {
        let mut other = emb(&[0.0, 0.0]);
        other.model_version = Some("other".into());
        let mut probe = emb(&[0.0, 0.0]);
        probe.model_version = Some("w600k_r50".into());
        assert_eq!(compare_many(&[other], &probe, 0.6), vec![false]);
    }

    #[test]
    fn test_no_votes_is_unknown() {
        let g = gallery(&[("alice", &[1.0, 0.0]), ("bob", &[0.0, 1.0])]);
        let m = VoteMatcher::default();
        assert_eq!(m.identify(&emb(&[-1.0, -1.0]), &g), Identity::Unknown);
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let m = VoteMatcher::default();
        assert_eq!(m.identify(&emb(&[0.0]), &Gallery::default()), Identity::Unknown);
    }

    #[test]
    fn test_single_label_match() {
        let g = gallery(&[
            ("alice", &[1.0, 0.0]),
            ("alice", &[0.9, 0.1]),
            ("bob", &[-1.0, 0.0]),
        ]);
        let m = VoteMatcher::default();
        assert_eq!(
            m.identify(&emb(&[1.0, 0.05]), &g),
            Identity::Known("alice".into())
        );
    }

    #[test]
    fn test_majority_wins_over_order() {
        let g = gallery(&[
            ("bob", &[0.0, 0.1]),
            ("alice", &[0.1, 0.0]),
            ("alice", &[0.0, 0.0]),
        ]);
        let m = VoteMatcher::default();
        assert_eq!(m.identify(&emb(&[0.0, 0.0]), &g), Identity::Known("alice".into()));
    }

    #[test]
    fn test_tie_break_is_first_in_gallery_order() {
        let g = gallery(&[
            ("A", &[0.0, 0.1]),
            ("B", &[0.1, 0.0]),
            ("B", &[5.0, 5.0]),
            ("A", &[5.0, 5.0]),
        ]);
        let m = VoteMatcher::default();
        for _ in 0..10 {
            assert_eq!(m.identify(&emb(&[0.0, 0.0]), &g), Identity::Known("A".into()));
        }
    }

    #[test]
    fn test_tie_break_follows_order_not_name() {
        let g = gallery(&[("zed", &[0.0, 0.1]), ("amy", &[0.1, 0.0])]);
        let m = VoteMatcher::default();
        assert_eq!(m.identify(&emb(&[0.0, 0.0]), &g), Identity::Known("zed".into()));
    }

    #[test]
    fn test_identify_all_preserves_order() {
        let g = gallery(&[("alice", &[1.0, 0.0]), ("bob", &[0.0, 1.0])]);
        let m = VoteMatcher::new(0.5);
        let ids = m.identify_all(&[emb(&[0.0, 1.0]), emb(&[9.0, 9.0]), emb(&[1.0, 0.0])], &g);
        assert_eq!(
            ids,
            vec![
                Identity::Known("bob".into()),
                Identity::Unknown,
                Identity::Known("alice".into())
            ]
        );
    }
}

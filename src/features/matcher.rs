//! Brute-force descriptor matching with a mutual-best consistency check.

use crate::features::FeatureSet;
use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Matches at or above this L2 descriptor distance are dropped.
    pub max_distance: f32,
    /// Keep a pair only when each side is the other's nearest neighbour.
    pub cross_check: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            max_distance: 80.0,
            cross_check: true,
        }
    }
}

/// Index of a keypoint in view A matched to one in view B.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub a: usize,
    pub b: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrespondenceSet {
    pub matches: Vec<Correspondence>,
}

impl CorrespondenceSet {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Pixel positions of every match, `(in A, in B)`.
    pub fn point_pairs(&self, a: &FeatureSet, b: &FeatureSet) -> Vec<(Vector2<f64>, Vector2<f64>)> {
        self.matches
            .iter()
            .map(|m| {
                let (ka, kb) = (&a.keypoints[m.a], &b.keypoints[m.b]);
                (
                    Vector2::new(ka.x as f64, ka.y as f64),
                    Vector2::new(kb.x as f64, kb.y as f64),
                )
            })
            .collect()
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn nearest(query: &[f32], candidates: &[Vec<f32>]) -> Option<(usize, f32)> {
    candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| (index, l2_distance(query, candidate)))
        .min_by(|x, y| x.1.total_cmp(&y.1))
}

/// Matches every descriptor of `a` against all of `b`.
///
/// The result is one-to-one. Without cross-checking, a feature of `b` chosen
/// by several features of `a` keeps only the closest of them.
pub fn match_features(a: &FeatureSet, b: &FeatureSet, config: &MatcherConfig) -> CorrespondenceSet {
    let mut matches = Vec::new();
    for (index_a, descriptor) in a.descriptors.iter().enumerate() {
        let Some((index_b, distance)) = nearest(descriptor, &b.descriptors) else {
            break;
        };
        if distance >= config.max_distance {
            continue;
        }
        if config.cross_check {
            match nearest(&b.descriptors[index_b], &a.descriptors) {
                Some((back, _)) if back == index_a => {}
                _ => continue,
            }
        }
        matches.push(Correspondence {
            a: index_a,
            b: index_b,
            distance,
        });
    }
    if !config.cross_check {
        matches.sort_by(|x, y| x.b.cmp(&y.b).then(x.distance.total_cmp(&y.distance)));
        matches.dedup_by_key(|m| m.b);
        matches.sort_by_key(|m| m.a);
    }
    debug!(
        "Matched {} of {} x {} features",
        matches.len(),
        a.len(),
        b.len()
    );
    CorrespondenceSet { matches }
}

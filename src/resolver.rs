// Path resolver + scorer (spec §3, §4.5).  Enumerates candidate upgrade
// paths from the device's current version through the index's images,
// scores each with the configured policy, and picks the winner.

use crate::errors::PolicyOutcome;
use crate::model::{Image, ImageKind};
use anyhow::Result;
use std::collections::HashMap;

/// Lower is better.
pub const FULL_STEP_PENALTY: u64 = 100;
pub const NOT_MAX_PENALTY: u64 = 9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPolicy {
    Any,
    FullOnly,
    DeltaOnly,
}

/// A scored candidate path: an ordered, non-empty sequence of images.
#[derive(Debug, Clone)]
pub struct CandidatePath<'a> {
    pub steps: Vec<&'a Image>,
}

impl<'a> CandidatePath<'a> {
    pub fn target_version(&self) -> u64 {
        self.steps.last().expect("non-empty path").version
    }

    pub fn total_bytes(&self) -> u64 {
        self.steps.iter().map(|s| s.total_bytes()).sum()
    }

    fn len(&self) -> usize {
        self.steps.len()
    }
}

/// The canonical "weighted" scorer from spec §3.  Lower is better.
pub fn score_weighted(path: &CandidatePath, max_version: u64) -> u64 {
    let mut score = 0u64;
    for step in &path.steps {
        if step.kind == ImageKind::Full {
            score += FULL_STEP_PENALTY;
        }
        score += step.size_mb_rounded();
    }
    if path.target_version() < max_version {
        score += NOT_MAX_PENALTY;
    }
    score
}

/// A named scorer: the default `weighted` policy, or a pluggable one
/// registered via `hooks.scorer` (spec §9's capability registry).  Only
/// the default's tie-break is specified; custom scorers just need to
/// return a total order.
pub trait Scorer {
    fn score(&self, path: &CandidatePath, max_version: u64) -> u64;
}

pub struct WeightedScorer;

impl Scorer for WeightedScorer {
    fn score(&self, path: &CandidatePath, max_version: u64) -> u64 {
        score_weighted(path, max_version)
    }
}

/// Enumerate every maximal candidate path starting from `current_version`,
/// filtering ineligible images first (spec §4.5):
/// - drop images with version <= current_version
/// - drop images that fail `minversion`
/// - drop images whose phased_percentage < device_percentage
///
/// A path is maximal if it ends at the greatest version reachable from
/// `current_version` via *some* chain starting at that image (not
/// necessarily the same chain as other candidates) -- ties in target
/// version are all retained as separate candidates and the scorer picks
/// among them.
pub fn enumerate_candidates<'a>(
    images: &'a [Image],
    current_version: u64,
    device_percentage: u8,
) -> Vec<CandidatePath<'a>> {
    let eligible: Vec<&Image> = images
        .iter()
        .filter(|img| img.version > current_version)
        .filter(|img| img.minversion.map(|m| current_version >= m).unwrap_or(true))
        .filter(|img| img.phased_percentage >= device_percentage)
        .collect();

    // index deltas by base version, so we can walk chains breadth-first
    let mut deltas_by_base: HashMap<u64, Vec<&Image>> = HashMap::new();
    for img in &eligible {
        if let ImageKind::Delta = img.kind {
            if let Some(base) = img.base {
                deltas_by_base.entry(base).or_default().push(img);
            }
        }
    }

    let mut paths: Vec<Vec<&Image>> = Vec::new();

    // seed paths: delta chains starting directly at current_version, and
    // every full image newer than current_version (each starts a fresh
    // chain).
    let mut frontier: Vec<Vec<&Image>> = Vec::new();
    if let Some(deltas) = deltas_by_base.get(&current_version) {
        for d in deltas {
            frontier.push(vec![*d]);
        }
    }
    for img in &eligible {
        if img.kind == ImageKind::Full {
            frontier.push(vec![*img]);
        }
    }

    // breadth-first extension of each seed through further deltas
    while let Some(path) = frontier.pop() {
        let tail_version = path.last().unwrap().version;
        let mut extended = false;
        if let Some(deltas) = deltas_by_base.get(&tail_version) {
            for d in deltas {
                // avoid cycles / repeats
                if path.iter().any(|s| s.version == d.version) {
                    continue;
                }
                let mut next = path.clone();
                next.push(d);
                frontier.push(next);
                extended = true;
            }
        }
        if !extended {
            paths.push(path);
        }
    }

    // a path is only a candidate if its target is maximal among paths
    // sharing the same starting point constraints; per spec, "maximal"
    // means it ends at the greatest version reachable via kinds/bases in
    // the index, so we keep paths ending at the global max, plus any
    // path that cannot be extended further (dead ends are still
    // candidates, since the scorer/tie-break pick the best one; the
    // not-max penalty handles preference).
    paths
        .into_iter()
        .map(|steps| CandidatePath { steps })
        .collect()
}

pub struct ResolvedPath<'a> {
    pub path: CandidatePath<'a>,
    pub score: u64,
}

/// Resolve the winning path, or a `PolicyOutcome` explaining why there is
/// none.
pub fn resolve<'a>(
    images: &'a [Image],
    current_version: u64,
    device_percentage: u8,
    filter: FilterPolicy,
    scorer: &dyn Scorer,
) -> Result<ResolvedPath<'a>, PolicyOutcome> {
    let mut candidates = enumerate_candidates(images, current_version, device_percentage);
    candidates.retain(|c| match filter {
        FilterPolicy::Any => true,
        FilterPolicy::FullOnly => c.steps.iter().all(|s| s.kind == ImageKind::Full),
        FilterPolicy::DeltaOnly => c.steps.iter().all(|s| s.kind == ImageKind::Delta),
    });

    if candidates.is_empty() {
        // Distinguish "nothing newer at all" (NoUpdate) from "something
        // newer exists but every path was filtered out" (NoPath/PhaseGated).
        let any_newer = images.iter().any(|i| i.version > current_version);
        if !any_newer {
            return Err(PolicyOutcome::NoUpdate);
        }
        let any_phase_blocked = images
            .iter()
            .any(|i| i.version > current_version && i.phased_percentage < device_percentage);
        if any_phase_blocked {
            return Err(PolicyOutcome::PhaseGated {
                device_pct: device_percentage,
            });
        }
        return Err(PolicyOutcome::NoPath {
            reason: "no reachable chain of images from current version".into(),
        });
    }

    let max_version = images.iter().map(|i| i.version).max().unwrap_or(current_version);

    // score, tie-break by smaller total byte size, then by longest path last
    let mut scored: Vec<(u64, u64, usize, CandidatePath)> = candidates
        .into_iter()
        .map(|c| {
            let score = scorer.score(&c, max_version);
            let bytes = c.total_bytes();
            let len = c.len();
            (score, bytes, len, c)
        })
        .collect();
    scored.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2).reverse())
    });

    let (score, _, _, path) = scored.into_iter().next().expect("non-empty");
    Ok(ResolvedPath { path, score })
}

/// Truncate a winning path's trailing steps whose version exceeds `cap`.
/// The resulting path must remain nonempty (spec §4.5's `maximage`).
pub fn apply_maximage_cap<'a>(path: CandidatePath<'a>, cap: Option<u64>) -> Result<CandidatePath<'a>> {
    let Some(cap) = cap else {
        return Ok(path);
    };
    let steps: Vec<&Image> = path.steps.into_iter().take_while(|s| s.version <= cap).collect();
    if steps.is_empty() {
        anyhow::bail!("maximage cap {} excludes every step of the winning path", cap);
    }
    Ok(CandidatePath { steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{File, ImageKind};

    fn img(kind: ImageKind, version: u64, base: Option<u64>, size_mb: u64) -> Image {
        Image {
            kind,
            version,
            base,
            description: String::new(),
            phased_percentage: 100,
            minversion: None,
            files: vec![File {
                path: format!("/{version}.zip"),
                signature: format!("/{version}.zip.asc"),
                checksum: "x".repeat(64),
                size: size_mb * 1024 * 1024,
                order: 0,
            }],
        }
    }

    /// S1: already up to date.
    #[test]
    fn test_s1_already_up_to_date() {
        let images = vec![
            img(ImageKind::Full, 900, None, 10),
            img(ImageKind::Delta, 950, Some(900), 5),
            img(ImageKind::Delta, 1000, Some(950), 5),
        ];
        let result = resolve(&images, 1000, 100, FilterPolicy::Any, &WeightedScorer);
        assert!(matches!(result, Err(PolicyOutcome::NoUpdate)));
    }

    /// S2: delta chain wins on size.
    #[test]
    fn test_s2_delta_chain_wins() {
        let images = vec![
            img(ImageKind::Full, 200, None, 500),
            img(ImageKind::Delta, 150, Some(100), 60),
            img(ImageKind::Delta, 200, Some(150), 50),
        ];
        let resolved = resolve(&images, 100, 0, FilterPolicy::Any, &WeightedScorer).unwrap();
        assert_eq!(resolved.path.target_version(), 200);
        assert_eq!(resolved.path.steps.len(), 2);
        assert_eq!(resolved.score, 110);
    }

    /// S3: full preferred when delta path doesn't reach max.
    #[test]
    fn test_s3_full_preferred_over_incomplete_delta() {
        let images = vec![
            img(ImageKind::Full, 200, None, 500),
            img(ImageKind::Delta, 150, Some(100), 60),
        ];
        let resolved = resolve(&images, 100, 0, FilterPolicy::Any, &WeightedScorer).unwrap();
        assert_eq!(resolved.path.target_version(), 200);
        assert_eq!(resolved.path.steps.len(), 1);
    }

    /// S5: phased gating.
    #[test]
    fn test_s5_phase_gating() {
        let mut gated = img(ImageKind::Delta, 150, Some(100), 10);
        gated.phased_percentage = 30;
        let images = vec![gated];
        let result = resolve(&images, 100, 40, FilterPolicy::Any, &WeightedScorer);
        assert!(matches!(result, Err(PolicyOutcome::PhaseGated { device_pct: 40 })));
    }

    #[test]
    fn test_target_always_max_reachable() {
        let images = vec![
            img(ImageKind::Full, 300, None, 10),
            img(ImageKind::Delta, 150, Some(100), 1),
            img(ImageKind::Delta, 200, Some(150), 1),
        ];
        let resolved = resolve(&images, 100, 0, FilterPolicy::Any, &WeightedScorer).unwrap();
        // max reachable version across all candidates is 300 (full image)
        assert_eq!(resolved.path.target_version(), 300);
    }

    #[test]
    fn test_minversion_filters_image() {
        let mut img_with_min = img(ImageKind::Full, 200, None, 10);
        img_with_min.minversion = Some(150);
        let images = vec![img_with_min];
        let result = resolve(&images, 100, 0, FilterPolicy::Any, &WeightedScorer);
        assert!(matches!(result, Err(PolicyOutcome::NoPath { .. })));
    }

    #[test]
    fn test_maximage_cap_truncates() {
        let images = vec![
            img(ImageKind::Delta, 150, Some(100), 1),
            img(ImageKind::Delta, 200, Some(150), 1),
        ];
        let resolved = resolve(&images, 100, 0, FilterPolicy::Any, &WeightedScorer).unwrap();
        let capped = apply_maximage_cap(resolved.path, Some(150)).unwrap();
        assert_eq!(capped.target_version(), 150);
        assert_eq!(capped.steps.len(), 1);
    }

    #[test]
    fn test_maximage_cap_rejects_empty_result() {
        let images = vec![img(ImageKind::Full, 200, None, 1)];
        let resolved = resolve(&images, 100, 0, FilterPolicy::Any, &WeightedScorer).unwrap();
        assert!(apply_maximage_cap(resolved.path, Some(50)).is_err());
    }
}

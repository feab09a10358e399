//! Release candidate sequencing

use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// One release offered by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseCandidate {
    /// Ingestion sequence; never reused
    pub sequence: u64,

    /// Version label as published upstream, possibly not semver
    #[serde(default)]
    pub version_label: Option<String>,
}

impl ReleaseCandidate {
    pub fn new(sequence: u64, version_label: Option<&str>) -> Self {
        Self {
            sequence,
            version_label: version_label.map(str::to_string),
        }
    }

    /// Parsed semantic version, if the label is one.
    pub fn version(&self) -> Option<Version> {
        self.version_label.as_deref().and_then(parse_version)
    }
}

/// Parse a version label leniently.
///
/// Accepts a leading `v`/`V` and pads a missing minor or patch component
/// (`1.2` is `1.2.0`). Anything else must be strict semver.
pub fn parse_version(label: &str) -> Option<Version> {
    let trimmed = label.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    // Pad the numeric core only; suffixes keep their position.
    let split_at = trimmed
        .find(|c: char| c == '-' || c == '+')
        .unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let components: Vec<&str> = core.split('.').collect();
    if components.is_empty()
        || components.len() > 2
        || components
            .iter()
            .any(|c| c.is_empty() || !c.chars().all(|ch| ch.is_ascii_digit()))
    {
        return None;
    }

    let padded = match components.len() {
        1 => format!("{}.0.0{}", core, suffix),
        _ => format!("{}.0{}", core, suffix),
    };
    Version::parse(&padded).ok()
}

/// Semantic precedence; build metadata does not participate.
fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

/// Orders release candidates for desired-state selection
#[derive(Debug, Clone, Default)]
pub struct VersionSequencer {
    /// Whether pre-release versions may be selected as desired
    pub include_prerelease: bool,
}

impl VersionSequencer {
    pub fn new(include_prerelease: bool) -> Self {
        Self { include_prerelease }
    }

    /// Produce the consideration order of `candidates`.
    ///
    /// Versioned candidates are sorted among the positions that versioned
    /// candidates occupied in the input; unversioned candidates stay where
    /// they were.
    pub fn order(&self, candidates: &[ReleaseCandidate]) -> Vec<ReleaseCandidate> {
        let mut slots = Vec::new();
        let mut versioned = Vec::new();

        for (index, candidate) in candidates.iter().enumerate() {
            if let Some(version) = candidate.version() {
                slots.push(index);
                versioned.push((version, candidate));
            }
        }

        versioned.sort_by(|(va, a), (vb, b)| {
            precedence(va, vb).then_with(|| a.sequence.cmp(&b.sequence))
        });

        let versioned_count = slots.len();
        let mut ordered: Vec<ReleaseCandidate> = candidates.to_vec();
        for (slot, (_, candidate)) in slots.into_iter().zip(versioned) {
            ordered[slot] = candidate.clone();
        }

        debug!(
            total = candidates.len(),
            unversioned = candidates.len() - versioned_count,
            "Sequenced release candidates"
        );

        ordered
    }

    /// The candidate that should become desired state.
    ///
    /// This is the last candidate of [`order`](Self::order), skipping
    /// pre-releases unless `include_prerelease` is set.
    pub fn select_desired(&self, candidates: &[ReleaseCandidate]) -> Option<ReleaseCandidate> {
        self.order(candidates).into_iter().rev().find(|candidate| {
            self.include_prerelease
                || candidate
                    .version()
                    .map(|v| v.pre.is_empty())
                    .unwrap_or(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sequences(candidates: &[ReleaseCandidate]) -> Vec<u64> {
        candidates.iter().map(|c| c.sequence).collect()
    }

    #[test]
    fn test_parse_version_lenient_forms() {
        assert_eq!(parse_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("1.2"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_version("2"), Some(Version::new(2, 0, 0)));
        assert_eq!(
            parse_version("1.4-beta.1").map(|v| v.pre.to_string()),
            Some("beta.1".to_string())
        );
        assert_eq!(parse_version("nightly"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_versions_sort_ascending() {
        let ordered = VersionSequencer::default().order(&[
            ReleaseCandidate::new(1, Some("2.0.0")),
            ReleaseCandidate::new(2, Some("1.0.0")),
            ReleaseCandidate::new(3, Some("1.5.0")),
        ]);
        assert_eq!(sequences(&ordered), vec![2, 3, 1]);
    }

    #[test]
    fn test_equal_versions_break_ties_by_sequence() {
        let ordered = VersionSequencer::default().order(&[
            ReleaseCandidate::new(4, Some("1.0.0+build.2")),
            ReleaseCandidate::new(7, Some("1.0.0+build.1")),
            ReleaseCandidate::new(9, Some("0.9.0")),
        ]);
        assert_eq!(sequences(&ordered), vec![9, 4, 7]);
    }

    #[test]
    fn test_unversioned_keep_their_position() {
        let ordered = VersionSequencer::default().order(&[
            ReleaseCandidate::new(1, Some("3.0.0")),
            ReleaseCandidate::new(2, None),
            ReleaseCandidate::new(3, Some("1.0.0")),
            ReleaseCandidate::new(4, Some("not-a-version")),
            ReleaseCandidate::new(5, Some("2.0.0")),
        ]);
        assert_eq!(sequences(&ordered), vec![3, 2, 5, 4, 1]);
    }

    #[test]
    fn test_prerelease_sorts_before_release() {
        let ordered = VersionSequencer::default().order(&[
            ReleaseCandidate::new(1, Some("1.0.0")),
            ReleaseCandidate::new(2, Some("1.0.0-rc.1")),
        ]);
        assert_eq!(sequences(&ordered), vec![2, 1]);
    }

    #[test]
    fn test_select_desired_skips_prerelease() {
        let candidates = [
            ReleaseCandidate::new(1, Some("1.0.0")),
            ReleaseCandidate::new(2, Some("1.1.0-beta.1")),
        ];

        let stable = VersionSequencer::default().select_desired(&candidates);
        assert_eq!(stable.map(|c| c.sequence), Some(1));

        let any = VersionSequencer::new(true).select_desired(&candidates);
        assert_eq!(any.map(|c| c.sequence), Some(2));

        assert!(VersionSequencer::default().select_desired(&[]).is_none());
    }

    fn arb_candidates() -> impl Strategy<Value = Vec<ReleaseCandidate>> {
        let label = prop_oneof![
            3 => (0u64..4, 0u64..4, 0u64..4).prop_map(|(a, b, c)| Some(format!("{}.{}.{}", a, b, c))),
            1 => Just(None),
            1 => Just(Some("latest".to_string())),
        ];
        prop::collection::vec(label, 0..24).prop_map(|labels| {
            labels
                .into_iter()
                .enumerate()
                .map(|(i, label)| ReleaseCandidate {
                    sequence: i as u64 * 3 + 1,
                    version_label: label,
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn versioned_candidates_are_ordered(candidates in arb_candidates()) {
            let ordered = VersionSequencer::default().order(&candidates);
            let versioned: Vec<(Version, u64)> = ordered
                .iter()
                .filter_map(|c| c.version().map(|v| (v, c.sequence)))
                .collect();

            for pair in versioned.windows(2) {
                let (va, sa) = &pair[0];
                let (vb, sb) = &pair[1];
                match precedence(va, vb) {
                    Ordering::Less => {}
                    Ordering::Equal => prop_assert!(sa < sb),
                    Ordering::Greater => prop_assert!(false, "{} after {}", va, vb),
                }
            }
        }

        #[test]
        fn unversioned_candidates_never_move(candidates in arb_candidates()) {
            let ordered = VersionSequencer::default().order(&candidates);
            prop_assert_eq!(ordered.len(), candidates.len());

            for (index, candidate) in candidates.iter().enumerate() {
                if candidate.version().is_none() {
                    prop_assert_eq!(&ordered[index], candidate);
                }
            }
        }
    }
}

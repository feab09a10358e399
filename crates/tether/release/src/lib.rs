//! # Tether Release - ordering of upstream release candidates
//!
//! The control plane offers a channel's releases as candidates, each with a
//! monotonically increasing sequence number and, usually, a semantic version.
//! [`VersionSequencer`] puts them in the order in which they should be
//! considered; the last candidate of that order becomes desired state.
//!
//! ## Ordering rules
//!
//! - Candidates with comparable versions sort ascending by version.
//! - Equal versions keep ascending sequence order.
//! - Candidates without a parsable version are incomparable: each keeps its
//!   input position and never moves relative to other unversioned candidates.
//!
//! Input is expected in ascending sequence order.
//!
//! ```
//! use tether_release::{ReleaseCandidate, VersionSequencer};
//!
//! let ordered = VersionSequencer::default().order(&[
//!     ReleaseCandidate::new(1, Some("1.2.0")),
//!     ReleaseCandidate::new(2, Some("1.1.0")),
//!     ReleaseCandidate::new(3, None),
//! ]);
//! let sequences: Vec<u64> = ordered.iter().map(|c| c.sequence).collect();
//! assert_eq!(sequences, vec![2, 1, 3]);
//! ```

#![deny(unsafe_code)]

mod sequencer;

pub use sequencer::{parse_version, ReleaseCandidate, VersionSequencer};

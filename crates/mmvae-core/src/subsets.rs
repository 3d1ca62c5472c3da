//! Powerset enumeration of modality names.
//!
//! The [`SubsetIndex`] is built once per experiment from the modality names and
//! never changes afterwards. Keys are the sorted member names joined with
//! [`SUBSET_SEPARATOR`]; the empty subset has the empty key.
//!
//! ```
//! use mmvae_core::subsets::SubsetIndex;
//!
//! let index = SubsetIndex::enumerate(&["b", "a"]).unwrap();
//! let keys: Vec<&str> = index.iter().map(|s| s.key().as_str()).collect();
//! assert_eq!(keys, vec!["", "b", "a", "a_b"]);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FusionError, FusionResult};

/// Separator between modality names inside a subset key.
pub const SUBSET_SEPARATOR: &str = "_";

/// Label reserved for the joint latent source.
pub const JOINT_LABEL: &str = "joint";

/// Above this many modalities the exponential subset count gets logged.
pub const RECOMMENDED_MAX_MODALITIES: usize = 5;

/// Hard limit on the number of modalities (2^10 subsets).
pub const MAX_MODALITIES: usize = 10;

/// Canonical key of a modality subset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubsetKey(String);

impl SubsetKey {
    /// Build the canonical key for a set of modality names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut sorted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        Self(sorted.join(SUBSET_SEPARATOR))
    }

    /// Key of the empty subset.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SubsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubsetKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// One element of the powerset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subset {
    key: SubsetKey,
    /// Member names in sorted order.
    modalities: Vec<String>,
}

impl Subset {
    pub fn key(&self) -> &SubsetKey {
        &self.key
    }

    /// Member modality names, sorted.
    pub fn modalities(&self) -> &[String] {
        &self.modalities
    }

    pub fn len(&self) -> usize {
        self.modalities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modalities.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.modalities.len() == 1
    }

    pub fn contains(&self, modality: &str) -> bool {
        self.modalities.iter().any(|m| m == modality)
    }

    /// Whether every member is in `present`.
    pub fn is_covered_by(&self, present: &BTreeSet<String>) -> bool {
        self.modalities.iter().all(|m| present.contains(m))
    }
}

/// Cached powerset of the experiment's modality names.
#[derive(Debug, Clone)]
pub struct SubsetIndex {
    /// Modality names in registration order.
    modalities: Vec<String>,
    /// All 2^n subsets, by size then by registration-order combination.
    subsets: Vec<Subset>,
    /// Key to position in `subsets`.
    positions: BTreeMap<SubsetKey, usize>,
}

impl SubsetIndex {
    /// Enumerate all `2^n` subsets of `names`.
    ///
    /// # Errors
    ///
    /// - `FusionError::NoModalities` if `names` is empty
    /// - `FusionError::DuplicateModality` on repeated names
    /// - `FusionError::InvalidModalityName` for empty names, names containing
    ///   the separator, or the reserved `joint` label
    /// - `FusionError::Config` above [`MAX_MODALITIES`]
    pub fn enumerate<S: AsRef<str>>(names: &[S]) -> FusionResult<Self> {
        if names.is_empty() {
            return Err(FusionError::NoModalities);
        }
        if names.len() > MAX_MODALITIES {
            return Err(FusionError::config(format!(
                "{} modalities exceed the limit of {} ({} subsets)",
                names.len(),
                MAX_MODALITIES,
                1usize << names.len()
            )));
        }
        if names.len() > RECOMMENDED_MAX_MODALITIES {
            warn!(
                num_modalities = names.len(),
                num_subsets = 1usize << names.len(),
                "Subset count grows exponentially with the number of modalities"
            );
        }

        let mut modalities: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            validate_modality_name(name)?;
            if modalities.iter().any(|m| m == name) {
                return Err(FusionError::DuplicateModality(name.to_string()));
            }
            modalities.push(name.to_string());
        }

        let n = modalities.len();
        let mut subsets = Vec::with_capacity(1 << n);
        for size in 0..=n {
            for combo in combinations(n, size) {
                let mut members: Vec<String> =
                    combo.iter().map(|&i| modalities[i].clone()).collect();
                members.sort();
                subsets.push(Subset {
                    key: SubsetKey::from_names(&members),
                    modalities: members,
                });
            }
        }

        let positions: BTreeMap<SubsetKey, usize> = subsets
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.clone(), i))
            .collect();
        debug_assert_eq!(positions.len(), subsets.len(), "subset keys must be unique");

        debug!(
            num_modalities = n,
            num_subsets = subsets.len(),
            "Enumerated modality subsets"
        );

        Ok(Self {
            modalities,
            subsets,
            positions,
        })
    }

    /// Modality names in registration order.
    pub fn modalities(&self) -> &[String] {
        &self.modalities
    }

    /// Number of subsets, `2^n`.
    pub fn len(&self) -> usize {
        self.subsets.len()
    }

    /// Never true: the empty subset is always present.
    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }

    /// All subsets including the empty one.
    pub fn iter(&self) -> impl Iterator<Item = &Subset> {
        self.subsets.iter()
    }

    /// All subset keys including the empty key.
    pub fn keys(&self) -> impl Iterator<Item = &SubsetKey> {
        self.subsets.iter().map(|s| &s.key)
    }

    /// Subsets with at least one member.
    pub fn non_empty(&self) -> impl Iterator<Item = &Subset> {
        self.subsets.iter().filter(|s| !s.is_empty())
    }

    /// One-member subsets, in registration order.
    pub fn singletons(&self) -> impl Iterator<Item = &Subset> {
        self.subsets.iter().filter(|s| s.is_singleton())
    }

    /// Subset containing every modality.
    pub fn full_set(&self) -> &Subset {
        // The last combination enumerated is the full set.
        &self.subsets[self.subsets.len() - 1]
    }

    pub fn get(&self, key: &SubsetKey) -> Option<&Subset> {
        self.positions.get(key).map(|&i| &self.subsets[i])
    }

    /// Look up a subset, failing with `UnknownSubset`.
    pub fn require(&self, key: &SubsetKey) -> FusionResult<&Subset> {
        self.get(key)
            .ok_or_else(|| FusionError::UnknownSubset(key.to_string()))
    }

    /// Non-empty subsets whose members are all in `present`.
    pub fn covered_by<'a>(
        &'a self,
        present: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = &'a Subset> + 'a {
        self.non_empty().filter(move |s| s.is_covered_by(present))
    }
}

fn validate_modality_name(name: &str) -> FusionResult<()> {
    if name.is_empty() {
        return Err(FusionError::invalid_modality_name(name, "name must not be empty"));
    }
    if name.contains(SUBSET_SEPARATOR) {
        return Err(FusionError::invalid_modality_name(
            name,
            format!("name must not contain the subset separator '{}'", SUBSET_SEPARATOR),
        ));
    }
    if name == JOINT_LABEL {
        return Err(FusionError::invalid_modality_name(
            name,
            "name is reserved for the joint latent source",
        ));
    }
    Ok(())
}

/// Index combinations of `size` out of `n`, in lexicographic order.
fn combinations(n: usize, size: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(size);
    fn recurse(start: usize, n: usize, size: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == size {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            recurse(i + 1, n, size, current, out);
            current.pop();
        }
    }
    recurse(0, n, size, &mut current, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_powerset_size_and_unique_keys() {
        for n in 1..=6 {
            let names: Vec<String> = (0..n).map(|i| format!("m{}", i)).collect();
            let index = SubsetIndex::enumerate(&names).unwrap();
            assert_eq!(index.len(), 1 << n, "n={} should give 2^n subsets", n);

            let unique: BTreeSet<&SubsetKey> = index.keys().collect();
            assert_eq!(unique.len(), index.len(), "keys must be unique for n={}", n);
            assert!(index.get(&SubsetKey::empty()).is_some());
        }
    }

    #[test]
    fn test_three_modalities_order_matches_powerset() {
        let index = SubsetIndex::enumerate(&["a", "b", "c"]).unwrap();
        let keys: Vec<&str> = index.keys().map(SubsetKey::as_str).collect();
        assert_eq!(keys, vec!["", "a", "b", "c", "a_b", "a_c", "b_c", "a_b_c"]);
        assert_eq!(index.full_set().key().as_str(), "a_b_c");
        assert_eq!(index.singletons().count(), 3);
        assert_eq!(index.non_empty().count(), 7);
    }

    #[test]
    fn test_keys_are_sorted_regardless_of_registration_order() {
        let index = SubsetIndex::enumerate(&["text", "img"]).unwrap();
        assert_eq!(index.full_set().key().as_str(), "img_text");
        assert_eq!(index.full_set().modalities(), &["img".to_string(), "text".to_string()]);
        assert_eq!(index.modalities(), &["text".to_string(), "img".to_string()]);
    }

    #[test]
    fn test_covered_by_present_modalities() {
        let index = SubsetIndex::enumerate(&["a", "b", "c"]).unwrap();
        let present: BTreeSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
        let keys: Vec<&str> = index.covered_by(&present).map(|s| s.key().as_str()).collect();
        assert_eq!(keys, vec!["a", "c", "a_c"]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        assert!(matches!(
            SubsetIndex::enumerate::<&str>(&[]),
            Err(FusionError::NoModalities)
        ));
        assert!(matches!(
            SubsetIndex::enumerate(&["a", "a"]),
            Err(FusionError::DuplicateModality(_))
        ));
        assert!(matches!(
            SubsetIndex::enumerate(&["m_1"]),
            Err(FusionError::InvalidModalityName { .. })
        ));
        assert!(matches!(
            SubsetIndex::enumerate(&["joint"]),
            Err(FusionError::InvalidModalityName { .. })
        ));
        let too_many: Vec<String> = (0..=MAX_MODALITIES).map(|i| format!("m{}", i)).collect();
        assert!(matches!(
            SubsetIndex::enumerate(&too_many),
            Err(FusionError::Config { .. })
        ));
    }

    #[test]
    fn test_require_unknown_key() {
        let index = SubsetIndex::enumerate(&["a"]).unwrap();
        let err = index.require(&SubsetKey::from("a_b")).unwrap_err();
        assert!(matches!(err, FusionError::UnknownSubset(ref k) if k == "a_b"));
    }
}

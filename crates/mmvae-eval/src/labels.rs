//! Label columns and bounded resampling of classifier training rows.

use std::collections::BTreeMap;

use rand::Rng;
use tracing::{debug, error};

use crate::error::{EvalError, EvalResult};

/// Named label columns over the same rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
    columns: BTreeMap<String, Vec<u32>>,
    len: usize,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-label table.
    pub fn single(name: impl Into<String>, values: Vec<u32>) -> Self {
        let len = values.len();
        let mut columns = BTreeMap::new();
        columns.insert(name.into(), values);
        Self { columns, len }
    }

    /// Add a column. Every column must have the same number of rows.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<u32>) -> EvalResult<()> {
        let name = name.into();
        if !self.columns.is_empty() && values.len() != self.len {
            return Err(EvalError::invalid_input(format!(
                "label '{}' has {} rows, expected {}",
                name,
                values.len(),
                self.len
            )));
        }
        self.len = values.len();
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[u32]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn require(&self, name: &str) -> EvalResult<&[u32]> {
        self.get(name)
            .ok_or_else(|| EvalError::invalid_input(format!("unknown label '{}'", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u32>)> {
        self.columns.iter()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows at `indices`, in order, for every column.
    pub fn select(&self, indices: &[usize]) -> EvalResult<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len) {
            return Err(EvalError::invalid_input(format!(
                "row {} out of range for {} labels",
                bad, self.len
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| (name.clone(), indices.iter().map(|&i| values[i]).collect()))
            .collect();
        Ok(Self {
            columns,
            len: indices.len(),
        })
    }
}

/// Whether `values` holds at least two distinct classes.
pub fn has_both_classes(values: &[u32]) -> bool {
    match values.first() {
        Some(first) => values.iter().any(|v| v != first),
        None => false,
    }
}

/// Draw `num_train_samples` row indices (with replacement) until every label
/// column of the drawn rows contains at least two classes.
///
/// # Errors
///
/// `EvalError::LabelResampling` after `max_tries` draws without success. A
/// table where some label has a single class overall always ends here.
pub fn sample_training_indices<R: Rng + ?Sized>(
    labels: &LabelTable,
    num_train_samples: usize,
    max_tries: usize,
    rng: &mut R,
) -> EvalResult<Vec<usize>> {
    if labels.is_empty() || labels.columns.is_empty() {
        return Err(EvalError::invalid_input("no labels to sample from"));
    }
    if num_train_samples == 0 || max_tries == 0 {
        return Err(EvalError::invalid_input(
            "num_training_samples_lr and max_label_tries must be > 0",
        ));
    }

    let mut single_class = String::new();
    for tries in 1..=max_tries {
        let indices: Vec<usize> = (0..num_train_samples)
            .map(|_| rng.gen_range(0..labels.len()))
            .collect();
        let failing = labels.iter().find(|(_, values)| {
            let drawn: Vec<u32> = indices.iter().map(|&i| values[i]).collect();
            !has_both_classes(&drawn)
        });
        match failing {
            None => {
                debug!(tries, num_train_samples, "Sampled classifier training rows");
                return Ok(indices);
            }
            Some((name, _)) => single_class = name.clone(),
        }
    }

    error!(
        label = %single_class,
        max_tries,
        num_samples = labels.len(),
        num_train_samples,
        "Label resampling budget exhausted"
    );
    Err(EvalError::LabelResampling {
        label: single_class,
        tries: max_tries,
        num_samples: labels.len(),
        num_train_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_single_class_fails_after_budget() {
        let labels = LabelTable::single("digit", vec![1; 64]);
        let mut rng = StdRng::seed_from_u64(0);
        let err = sample_training_indices(&labels, 16, 7, &mut rng).unwrap_err();
        match err {
            EvalError::LabelResampling { label, tries, .. } => {
                assert_eq!(label, "digit");
                assert_eq!(tries, 7, "must stop exactly at the budget");
            }
            other => panic!("expected LabelResampling, got {:?}", other),
        }
    }

    #[test]
    fn test_balanced_labels_sample_both_classes() {
        let values: Vec<u32> = (0..100).map(|i| i % 2).collect();
        let labels = LabelTable::single("parity", values.clone());
        let mut rng = StdRng::seed_from_u64(1);
        let indices = sample_training_indices(&labels, 20, 10, &mut rng).unwrap();
        assert_eq!(indices.len(), 20);
        let drawn: Vec<u32> = indices.iter().map(|&i| values[i]).collect();
        assert!(has_both_classes(&drawn));
    }

    #[test]
    fn test_every_column_must_have_both_classes() {
        let mut labels = LabelTable::single("a", (0..50).map(|i| i % 2).collect());
        labels.insert("b", vec![0; 50]).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let err = sample_training_indices(&labels, 10, 3, &mut rng).unwrap_err();
        assert!(matches!(err, EvalError::LabelResampling { ref label, .. } if label == "b"));
    }

    #[test]
    fn test_insert_rejects_ragged_columns() {
        let mut labels = LabelTable::single("a", vec![0, 1, 0]);
        assert!(labels.insert("b", vec![0, 1]).is_err());
        assert_eq!(labels.names().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_select_rows() {
        let labels = LabelTable::single("a", vec![5, 6, 7]);
        let picked = labels.select(&[2, 0, 2]).unwrap();
        assert_eq!(picked.get("a"), Some(&[7, 5, 7][..]));
        assert!(labels.select(&[3]).is_err());
    }

    #[test]
    fn test_has_both_classes() {
        assert!(!has_both_classes(&[]));
        assert!(!has_both_classes(&[3, 3]));
        assert!(has_both_classes(&[0, 1]));
    }
}

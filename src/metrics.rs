/// Accuracy and confusion matrix over label sequences
use std::fmt;

use ndarray::Array2;

use crate::TrainerError;

/// Fraction of positions where `y_pred` equals `y_true`
pub fn accuracy_score(y_true: &[u32], y_pred: &[u32]) -> crate::Result<f64> {
    check_lengths(y_true, y_pred)?;
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    Ok(correct as f64 / y_true.len() as f64)
}

fn check_lengths(y_true: &[u32], y_pred: &[u32]) -> crate::Result<()> {
    if y_true.len() != y_pred.len() {
        return Err(TrainerError::Training(format!(
            "label length mismatch: {} true vs {} predicted",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(TrainerError::Training("no labels to score".to_string()));
    }
    Ok(())
}

/// `n_classes x n_classes` counts; row = true label, column = prediction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Array2<usize>,
}

impl ConfusionMatrix {
    pub fn from_labels(y_true: &[u32], y_pred: &[u32], n_classes: usize) -> crate::Result<Self> {
        check_lengths(y_true, y_pred)?;

        let mut counts = Array2::<usize>::zeros((n_classes, n_classes));
        for (&t, &p) in y_true.iter().zip(y_pred) {
            let (t, p) = (t as usize, p as usize);
            if t >= n_classes || p >= n_classes {
                return Err(TrainerError::Training(format!(
                    "label pair ({}, {}) outside of {} classes",
                    t, p, n_classes
                )));
            }
            counts[[t, p]] += 1;
        }

        Ok(Self { counts })
    }

    pub fn n_classes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn counts(&self) -> &Array2<usize> {
        &self.counts
    }

    pub fn get(&self, true_label: usize, predicted: usize) -> usize {
        self.counts[[true_label, predicted]]
    }

    pub fn total(&self) -> usize {
        self.counts.sum()
    }

    /// True when every off-diagonal count is zero
    pub fn is_diagonal(&self) -> bool {
        self.counts
            .indexed_iter()
            .all(|((i, j), &c)| i == j || c == 0)
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .counts
            .iter()
            .map(|c| c.to_string().len())
            .max()
            .unwrap_or(1);

        for (i, row) in self.counts.rows().into_iter().enumerate() {
            let cells: Vec<String> = row.iter().map(|c| format!("{:>width$}", c)).collect();
            let open = if i == 0 { "[[" } else { " [" };
            let close = if i + 1 == self.n_classes() { "]]" } else { "]" };
            writeln!(f, "{}{}{}", open, cells.join(" "), close)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy() {
        let acc = accuracy_score(&[0, 1, 1, 2], &[0, 1, 0, 2]).unwrap();
        assert!((acc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_rejects_bad_input() {
        assert!(accuracy_score(&[0, 1], &[0]).is_err());
        assert!(accuracy_score(&[], &[]).is_err());
    }

    #[test]
    fn test_confusion_includes_absent_classes() {
        let cm = ConfusionMatrix::from_labels(&[0, 0, 1], &[0, 1, 1], 4).unwrap();
        assert_eq!(cm.counts().dim(), (4, 4));
        assert_eq!(cm.get(0, 0), 1);
        assert_eq!(cm.get(0, 1), 1);
        assert_eq!(cm.get(1, 1), 1);
        assert_eq!(cm.get(3, 3), 0);
        assert_eq!(cm.total(), 3);
        assert!(!cm.is_diagonal());
    }

    #[test]
    fn test_diagonal() {
        let cm = ConfusionMatrix::from_labels(&[0, 1, 1], &[0, 1, 1], 2).unwrap();
        assert!(cm.is_diagonal());
        assert_eq!(cm.counts(), &ndarray::array![[1, 0], [0, 2]]);
    }

    #[test]
    fn test_out_of_range_label() {
        assert!(ConfusionMatrix::from_labels(&[0, 5], &[0, 1], 2).is_err());
    }

    #[test]
    fn test_display() {
        let cm = ConfusionMatrix::from_labels(&[0, 1, 1], &[0, 1, 1], 2).unwrap();
        assert_eq!(cm.to_string(), "[[1 0]\n [0 2]]\n");
    }
}

use crate::{matrix::DenseMatrix, Error, Result};

pub fn accuracy(logits: &DenseMatrix, labels: &[usize], num_classes: usize) -> Result<f32> {
    if logits.rows() != labels.len() {
        return Err(Error::ShapeMismatch(format!(
            "{} predictions for {} labels",
            logits.rows(),
            labels.len()
        )));
    }
    if logits.cols() != num_classes {
        return Err(Error::ShapeMismatch(format!(
            "logits have {} classes, expected {num_classes}",
            logits.cols()
        )));
    }
    if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
        return Err(Error::IndexOutOfBounds {
            index: label,
            len: num_classes,
        });
    }
    if labels.is_empty() {
        return Ok(0.0);
    }

    let correct = logits
        .argmax_rows()
        .iter()
        .zip(labels)
        .filter(|(pred, label)| pred == label)
        .count();

    Ok(correct as f32 / labels.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_argmax_hits() {
        let logits = DenseMatrix::new(4, 2, vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4, 0.3, 0.7]).unwrap();
        assert_eq!(accuracy(&logits, &[0, 1, 1, 1], 2).unwrap(), 0.75);
    }

    #[test]
    fn rejects_labels_outside_class_range() {
        let logits = DenseMatrix::zeros(1, 2);
        assert!(accuracy(&logits, &[2], 2).is_err());
        assert!(accuracy(&logits, &[0, 1], 2).is_err());
    }
}

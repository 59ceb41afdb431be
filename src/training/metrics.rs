//! Test-set diagnostics: confusion-matrix metrics and a per-class report.

use serde::Serialize;

/// Binary metrics with class 1 (fraud) as the positive class.
#[derive(Debug, Clone, Serialize)]
pub struct BinaryMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    pub fn_count: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

impl BinaryMetrics {
    pub fn compute(predictions: &[u8], labels: &[u8]) -> Self {
        assert_eq!(
            predictions.len(),
            labels.len(),
            "predictions and labels must have same length"
        );
        let (mut tp, mut fp, mut tn, mut fn_count) = (0, 0, 0, 0);
        for (&pred, &label) in predictions.iter().zip(labels) {
            match (pred, label) {
                (1, 1) => tp += 1,
                (1, _) => fp += 1,
                (_, 1) => fn_count += 1,
                _ => tn += 1,
            }
        }
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_count);
        Self {
            accuracy: ratio(tp + tn, labels.len()),
            precision,
            recall,
            f1: f1(precision, recall),
            tp,
            fp,
            tn,
            fn_count,
        }
    }

    /// Accuracy of always predicting the more common class.
    pub fn majority_baseline(labels: &[u8]) -> f64 {
        let positives = labels.iter().filter(|&&l| l == 1).count();
        ratio(positives.max(labels.len() - positives), labels.len())
    }
}

impl std::fmt::Display for BinaryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acc={:.4} prec={:.4} rec={:.4} f1={:.4} (tp={} fp={} tn={} fn={})",
            self.accuracy, self.precision, self.recall, self.f1, self.tp, self.fp, self.tn, self.fn_count,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassReport {
    pub name: &'static str,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision / recall / F1 with macro and weighted averages.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationReport {
    pub classes: [ClassReport; 2],
    pub accuracy: f64,
    pub macro_avg: ClassReport,
    pub weighted_avg: ClassReport,
}

impl ClassificationReport {
    pub fn from_metrics(m: &BinaryMetrics) -> Self {
        let normal_precision = ratio(m.tn, m.tn + m.fn_count);
        let normal_recall = ratio(m.tn, m.tn + m.fp);
        let normal = ClassReport {
            name: "Normal",
            precision: normal_precision,
            recall: normal_recall,
            f1: f1(normal_precision, normal_recall),
            support: m.tn + m.fp,
        };
        let fraud = ClassReport {
            name: "Fraud",
            precision: m.precision,
            recall: m.recall,
            f1: m.f1,
            support: m.tp + m.fn_count,
        };
        let total = normal.support + fraud.support;
        let avg = |name, w0: f64, w1: f64| ClassReport {
            name,
            precision: normal.precision * w0 + fraud.precision * w1,
            recall: normal.recall * w0 + fraud.recall * w1,
            f1: normal.f1 * w0 + fraud.f1 * w1,
            support: total,
        };
        let macro_avg = avg("macro avg", 0.5, 0.5);
        let weighted_avg = avg(
            "weighted avg",
            ratio(normal.support, total),
            ratio(fraud.support, total),
        );
        Self {
            classes: [normal, fraud],
            accuracy: m.accuracy,
            macro_avg,
            weighted_avg,
        }
    }
}

impl std::fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>14} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1-score", "support")?;
        for c in &self.classes {
            writeln!(f, "{:>14} {:>9.2} {:>9.2} {:>9.2} {:>9}", c.name, c.precision, c.recall, c.f1, c.support)?;
        }
        writeln!(f)?;
        writeln!(f, "{:>14} {:>9} {:>9} {:>9.2} {:>9}", "accuracy", "", "", self.accuracy, self.macro_avg.support)?;
        for c in [&self.macro_avg, &self.weighted_avg] {
            writeln!(f, "{:>14} {:>9.2} {:>9.2} {:>9.2} {:>9}", c.name, c.precision, c.recall, c.f1, c.support)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_confusion_matrix() {
        // 3 TP, 1 FP, 2 TN, 1 FN
        let preds = [1, 1, 1, 1, 0, 0, 0];
        let labels = [1, 1, 1, 0, 0, 0, 1];
        let m = BinaryMetrics::compute(&preds, &labels);
        assert_eq!((m.tp, m.fp, m.tn, m.fn_count), (3, 1, 2, 1));
        assert!((m.accuracy - 5.0 / 7.0).abs() < 1e-9);
        assert!((m.precision - 0.75).abs() < 1e-9);
        assert!((m.recall - 0.75).abs() < 1e-9);
    }

    #[test]
    fn no_positive_predictions_gives_zero_precision() {
        let m = BinaryMetrics::compute(&[0, 0, 0, 0], &[0, 0, 0, 1]);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert!((m.accuracy - 0.75).abs() < 1e-9);
        assert!((BinaryMetrics::majority_baseline(&[0, 0, 0, 1]) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn report_has_per_class_rows() {
        let m = BinaryMetrics::compute(&[1, 0, 0, 0, 1], &[1, 0, 0, 1, 0]);
        let r = ClassificationReport::from_metrics(&m);
        assert_eq!(r.classes[0].support, 3);
        assert_eq!(r.classes[1].support, 2);
        assert!((r.classes[0].precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((r.classes[0].recall - 2.0 / 3.0).abs() < 1e-9);
        let text = r.to_string();
        assert!(text.contains("Normal") && text.contains("Fraud") && text.contains("weighted avg"));
    }
}

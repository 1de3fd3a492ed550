//! Score partitioning between predicted and discarded labels.
//!
//! With a user-supplied threshold, both lists are merged and re-split on it.
//! Without one, each annotation is judged against its own per-label
//! threshold; annotations that carry none are kept.

use crate::native::{Labels, PredictionRecord};

/// Re-partition every output of a record.
pub fn partition_record(record: &mut PredictionRecord, user_threshold: Option<f64>) {
    for output in &mut record.outputs {
        partition_labels(&mut output.labels, user_threshold);
    }
}

fn partition_labels(labels: &mut Labels, user_threshold: Option<f64>) {
    let mut all = std::mem::take(&mut labels.predicted);
    all.append(&mut labels.discarded);

    for ann in all {
        let keep = match user_threshold {
            Some(t) => ann.score >= t,
            None => ann.score >= ann.threshold.unwrap_or(0.0),
        };
        if keep {
            labels.predicted.push(ann);
        } else {
            labels.discarded.push(ann);
        }
    }
}

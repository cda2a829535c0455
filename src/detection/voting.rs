//! Majority-vote smoothing over the detection history

use crate::camera_state::DetectionEntry;
use std::collections::VecDeque;

/// True when at least `threshold` of the last `window` labels are the defect label.
///
/// An empty history never passes, a threshold of 0 counts as 1, and a
/// threshold larger than the window can never be met.
pub fn passes_majority_vote(
    history: &VecDeque<DetectionEntry>,
    defect_label: &str,
    window: usize,
    threshold: usize,
) -> bool {
    let threshold = threshold.max(1);
    if history.is_empty() || threshold > window {
        return false;
    }
    let defects = history
        .iter()
        .rev()
        .take(window)
        .filter(|e| e.label == defect_label)
        .count();
    defects >= threshold
}

use crate::emotion::{EmotionLabel, EmotionProbabilities};

/// Minimum `sad` probability (0..=100) for a sad classification to stand.
pub const DEFAULT_SAD_THRESHOLD: f32 = 40.0;

/// Demotes a low-confidence `sad` to `neutral`. Other labels pass through.
///
/// A missing `sad` entry counts as 0.
pub fn apply_threshold(
    label: EmotionLabel,
    probabilities: &EmotionProbabilities,
    threshold: f32,
) -> EmotionLabel {
    if label != EmotionLabel::Sad {
        return label;
    }
    let sad = probabilities
        .get(&EmotionLabel::Sad)
        .copied()
        .unwrap_or(0.0);
    if sad < threshold {
        EmotionLabel::Neutral
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probs(entries: &[(EmotionLabel, f32)]) -> EmotionProbabilities {
        entries.iter().copied().collect()
    }

    #[test]
    fn sad_below_threshold_becomes_neutral() {
        let p = probs(&[(EmotionLabel::Sad, 39.0)]);
        assert_eq!(
            apply_threshold(EmotionLabel::Sad, &p, 40.0),
            EmotionLabel::Neutral
        );
    }

    #[test]
    fn sad_at_threshold_stays_sad() {
        let p = probs(&[(EmotionLabel::Sad, 40.0)]);
        assert_eq!(apply_threshold(EmotionLabel::Sad, &p, 40.0), EmotionLabel::Sad);
    }

    #[test]
    fn other_labels_are_never_touched() {
        let p = probs(&[(EmotionLabel::Sad, 5.0)]);
        assert_eq!(
            apply_threshold(EmotionLabel::Happy, &p, 40.0),
            EmotionLabel::Happy
        );
        let p = probs(&[(EmotionLabel::Angry, 1.0)]);
        assert_eq!(
            apply_threshold(EmotionLabel::Angry, &p, 40.0),
            EmotionLabel::Angry
        );
    }

    #[test]
    fn missing_sad_probability_demotes() {
        assert_eq!(
            apply_threshold(EmotionLabel::Sad, &EmotionProbabilities::new(), 40.0),
            EmotionLabel::Neutral
        );
    }
}

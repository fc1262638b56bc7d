use crate::types::{BinaryMask, CloudDecision, CloudError, CloudResult, PredictionMap};
use ndarray::{Array2, Zip};

/// Percentage of flagged pixels above which a scene counts as cloudy
pub const CLOUDY_FRACTION_PERCENT: f64 = 5.0;

/// Thresholding and decision parameters
#[derive(Debug, Clone)]
pub struct ThresholdParams {
    /// Majority-vote window edge; 0 or 1 disables smoothing
    pub post_filter_size: usize,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self { post_filter_size: 1 }
    }
}

/// Converts prediction maps into cloud masks and a scene decision
pub struct Thresholder {
    params: ThresholdParams,
}

impl Thresholder {
    pub fn new(params: ThresholdParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ThresholdParams {
        &self.params
    }

    /// Thick and thin cloud masks for `prediction`
    ///
    /// Thin cloud never overlaps thick cloud, before or after smoothing.
    /// Invalid (`NaN`) scores fall in neither mask.
    pub fn masks(
        &self,
        prediction: &PredictionMap,
        cloud_threshold: f32,
        thin_cloud_threshold: f32,
    ) -> CloudResult<(BinaryMask, BinaryMask)> {
        if !cloud_threshold.is_finite() || !thin_cloud_threshold.is_finite() {
            return Err(CloudError::InvalidConfiguration(format!(
                "Thresholds must be finite (cloud {}, thin {})",
                cloud_threshold, thin_cloud_threshold
            )));
        }

        let thick = prediction.mapv(|score| score > cloud_threshold);
        let thin = Zip::from(prediction)
            .and(&thick)
            .map_collect(|&score, &is_thick| score > thin_cloud_threshold && !is_thick);

        if self.params.post_filter_size <= 1 {
            return Ok((thick, thin));
        }

        log::debug!(
            "Majority-vote smoothing with {}x{} window",
            self.params.post_filter_size,
            self.params.post_filter_size
        );
        let thick = majority_filter(&thick, self.params.post_filter_size);
        let thin = majority_filter(&thin, self.params.post_filter_size);
        // Disjoint inputs cannot both win a strict majority, and ties keep the input
        debug_assert!(Zip::from(&thick).and(&thin).all(|&a, &b| !(a && b)));
        Ok((thick, thin))
    }

    /// Cloud fraction over thick and thin masks combined
    pub fn decide(&self, thick: &BinaryMask, thin: &BinaryMask) -> CloudResult<CloudDecision> {
        if thick.dim() != thin.dim() {
            return Err(CloudError::ShapeMismatch(format!(
                "Thick mask {:?} and thin mask {:?} differ",
                thick.dim(),
                thin.dim()
            )));
        }

        let total = thick.len();
        let flagged = Zip::from(thick)
            .and(thin)
            .fold(0usize, |acc, &a, &b| acc + usize::from(a || b));
        let cloud_fraction = if total == 0 {
            0.0
        } else {
            100.0 * flagged as f64 / total as f64
        };

        let decision = CloudDecision {
            cloud_fraction,
            is_cloudy: cloud_fraction > CLOUDY_FRACTION_PERCENT,
        };
        log::info!(
            "Cloud fraction {:.2}% ({} of {} pixels), cloudy: {}",
            cloud_fraction,
            flagged,
            total,
            decision.is_cloudy
        );
        Ok(decision)
    }
}

impl Default for Thresholder {
    fn default() -> Self {
        Self::new(ThresholdParams::default())
    }
}

/// Cloud decision with the default 5 % policy
pub fn decide(thick: &BinaryMask, thin: &BinaryMask) -> CloudResult<CloudDecision> {
    Thresholder::default().decide(thick, thin)
}

/// Majority vote over a `size` x `size` window centred on each pixel
///
/// Windows are truncated at the raster edge and the vote is taken over the
/// remaining cells. A tie keeps the pixel's own value. For even sizes the
/// window extends one cell further up/left than down/right.
pub fn majority_filter(mask: &BinaryMask, size: usize) -> BinaryMask {
    if size <= 1 {
        return mask.clone();
    }
    let (rows, cols) = mask.dim();
    let before = size / 2;
    let after = (size - 1) / 2;

    // Summed-area table with a zero border row/column
    let mut integral = Array2::<u32>::zeros((rows + 1, cols + 1));
    for r in 0..rows {
        let mut row_sum = 0u32;
        for c in 0..cols {
            row_sum += u32::from(mask[[r, c]]);
            integral[[r + 1, c + 1]] = integral[[r, c + 1]] + row_sum;
        }
    }

    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let r0 = r.saturating_sub(before);
        let r1 = (r + after + 1).min(rows);
        let c0 = c.saturating_sub(before);
        let c1 = (c + after + 1).min(cols);

        let votes = integral[[r1, c1]] + integral[[r0, c0]] - integral[[r0, c1]] - integral[[r1, c0]];
        let cells = ((r1 - r0) * (c1 - c0)) as u32;
        match (2 * votes).cmp(&cells) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => mask[[r, c]],
        }
    })
}

/// Encode masks as 0 = clear, 1 = thin cloud, 2 = thick cloud
pub fn classify(thick: &BinaryMask, thin: &BinaryMask) -> CloudResult<Array2<u8>> {
    if thick.dim() != thin.dim() {
        return Err(CloudError::ShapeMismatch(format!(
            "Thick mask {:?} and thin mask {:?} differ",
            thick.dim(),
            thin.dim()
        )));
    }
    Ok(Zip::from(thick)
        .and(thin)
        .map_collect(|&k, &t| if k { 2 } else { u8::from(t) }))
}

/// Minimum and maximum over valid scores, `None` if every pixel is invalid
pub fn finite_range(prediction: &PredictionMap) -> Option<(f32, f32)> {
    prediction
        .iter()
        .filter(|v| v.is_finite())
        .fold(None, |range, &v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_uniform_low_score_is_clear() {
        let prediction = PredictionMap::from_elem((20, 20), 0.001);
        let thresholder = Thresholder::default();
        let (thick, thin) = thresholder.masks(&prediction, 0.015, 0.007).unwrap();
        assert!(thick.iter().all(|v| !v));
        assert!(thin.iter().all(|v| !v));
        let decision = thresholder.decide(&thick, &thin).unwrap();
        assert_eq!(decision.cloud_fraction, 0.0);
        assert!(!decision.is_cloudy);
    }

    #[test]
    fn test_uniform_high_score_is_cloudy() {
        let prediction = PredictionMap::from_elem((20, 20), 0.02);
        let thresholder = Thresholder::default();
        let (thick, thin) = thresholder.masks(&prediction, 0.015, 0.007).unwrap();
        assert!(thick.iter().all(|v| *v));
        assert!(thin.iter().all(|v| !v));
        let decision = thresholder.decide(&thick, &thin).unwrap();
        assert_abs_diff_eq!(decision.cloud_fraction, 100.0);
        assert!(decision.is_cloudy);
    }

    #[test]
    fn test_exactly_five_percent_is_not_cloudy() {
        let mut thick = BinaryMask::from_elem((10, 10), false);
        let thin = BinaryMask::from_elem((10, 10), false);
        for c in 0..5 {
            thick[[0, c]] = true;
        }
        let decision = decide(&thick, &thin).unwrap();
        assert_abs_diff_eq!(decision.cloud_fraction, 5.0);
        assert!(!decision.is_cloudy);

        thick[[1, 0]] = true;
        assert!(decide(&thick, &thin).unwrap().is_cloudy);
    }

    #[test]
    fn test_thin_disjoint_from_thick() {
        let prediction = Array2::from_shape_fn((16, 16), |(r, c)| ((r * 16 + c) as f32) * 0.0002);
        for post_filter_size in [1, 2, 3, 5] {
            let thresholder = Thresholder::new(ThresholdParams { post_filter_size });
            for (cloud, thin_threshold) in [(0.015, 0.007), (0.02, 0.01), (0.01, 0.01)] {
                let (thick, thin) = thresholder.masks(&prediction, cloud, thin_threshold).unwrap();
                assert!(Zip::from(&thick).and(&thin).all(|&a, &b| !(a && b)));
            }
        }
    }

    #[test]
    fn test_nan_scores_in_neither_mask() {
        let mut prediction = PredictionMap::from_elem((3, 3), 0.5);
        prediction[[1, 1]] = f32::NAN;
        let (thick, thin) = Thresholder::default().masks(&prediction, 0.015, 0.007).unwrap();
        assert!(!thick[[1, 1]]);
        assert!(!thin[[1, 1]]);
        assert_eq!(finite_range(&prediction), Some((0.5, 0.5)));
    }

    #[test]
    fn test_non_finite_threshold_rejected() {
        let prediction = PredictionMap::zeros((2, 2));
        let result = Thresholder::default().masks(&prediction, f32::NAN, 0.007);
        assert!(matches!(result, Err(CloudError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_majority_filter_removes_speckle() {
        let mut mask = BinaryMask::from_elem((5, 5), false);
        mask[[2, 2]] = true;
        let filtered = majority_filter(&mask, 3);
        assert!(filtered.iter().all(|v| !v));

        let mut mask = BinaryMask::from_elem((5, 5), true);
        mask[[2, 2]] = false;
        let filtered = majority_filter(&mask, 3);
        assert!(filtered.iter().all(|v| *v));
    }

    #[test]
    fn test_majority_filter_tie_keeps_value() {
        // 2x2 window on a checkerboard: every full window is a 2-2 tie
        let mask = Array2::from_shape_fn((4, 4), |(r, c)| (r + c) % 2 == 0);
        let filtered = majority_filter(&mask, 2);
        for r in 1..4 {
            for c in 1..4 {
                assert_eq!(filtered[[r, c]], mask[[r, c]]);
            }
        }
    }

    #[test]
    fn test_majority_filter_size_one_is_identity() {
        let mask = Array2::from_shape_fn((4, 4), |(r, c)| (r * c) % 3 == 0);
        assert_eq!(majority_filter(&mask, 1), mask);
    }

    #[test]
    fn test_classify() {
        let thick = Array2::from_shape_vec((1, 3), vec![true, false, false]).unwrap();
        let thin = Array2::from_shape_vec((1, 3), vec![false, true, false]).unwrap();
        let classes = classify(&thick, &thin).unwrap();
        assert_eq!(classes.iter().copied().collect::<Vec<_>>(), vec![2, 1, 0]);
    }
}

use serde::{Deserialize, Serialize};

/// What to do with a FLAC source whose format is above the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HigherQualityBehavior {
    /// Leave the source untouched and copy it across
    Skip,
    /// Re-encode down to the target sample rate and bit depth
    Downsample,
}

/// Sample rate and bit depth of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bit_depth: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, bit_depth: u16) -> Self {
        Self { sample_rate, bit_depth }
    }

    /// A source exceeds the target when EITHER its sample rate OR its bit depth is higher.
    ///
    /// A 192kHz/16-bit file against an 88.2kHz/24-bit target exceeds it, as does
    /// a 44.1kHz/32-bit file.
    pub fn exceeds(&self, target: &PcmFormat) -> bool {
        self.sample_rate > target.sample_rate || self.bit_depth > target.bit_depth
    }
}

/// Decision for a FLAC source during standardization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlacAction {
    /// Copy the file byte-for-byte
    CopyUnchanged,
    /// Re-encode at the target format
    Downsample,
}

/// Decide how a FLAC source is carried into the processed tree
pub fn flac_action(
    source: &PcmFormat,
    target: &PcmFormat,
    standardization: bool,
    behavior: HigherQualityBehavior,
) -> FlacAction {
    if !standardization || !source.exceeds(target) {
        return FlacAction::CopyUnchanged;
    }
    match behavior {
        HigherQualityBehavior::Skip => FlacAction::CopyUnchanged,
        HigherQualityBehavior::Downsample => FlacAction::Downsample,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exceeds_on_either_dimension() {
        let target = PcmFormat::new(88_200, 24);
        assert!(PcmFormat::new(192_000, 16).exceeds(&target));
        assert!(PcmFormat::new(44_100, 32).exceeds(&target));
        assert!(!PcmFormat::new(88_200, 24).exceeds(&target));
        assert!(!PcmFormat::new(44_100, 16).exceeds(&target));
    }

    #[test]
    fn test_flac_action_respects_behavior() {
        let target = PcmFormat::new(88_200, 24);
        let hi = PcmFormat::new(176_400, 24);
        assert_eq!(
            flac_action(&hi, &target, true, HigherQualityBehavior::Downsample),
            FlacAction::Downsample
        );
        assert_eq!(
            flac_action(&hi, &target, true, HigherQualityBehavior::Skip),
            FlacAction::CopyUnchanged
        );
        assert_eq!(
            flac_action(&hi, &target, false, HigherQualityBehavior::Downsample),
            FlacAction::CopyUnchanged
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Sources at or below target in both dimensions are never re-encoded
        #[test]
        fn test_never_upsamples(
            rate in 8_000u32..=88_200,
            depth in 8u16..=24,
        ) {
            let target = PcmFormat::new(88_200, 24);
            let action = flac_action(
                &PcmFormat::new(rate, depth),
                &target,
                true,
                HigherQualityBehavior::Downsample,
            );
            prop_assert_eq!(action, FlacAction::CopyUnchanged);
        }
    }
}

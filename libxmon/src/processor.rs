use std::collections::BTreeMap;

use ndarray::Array2;

use super::config::ProcessingConfig;
use super::error::FrameExtractionError;
use super::frame::{decode_frame, PeakList, ProcessedFrame, RawEvent};
use super::geometry::{CameraLength, Detector};

/// The detector constants a processor needs, pulled out of the Detector once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryInfo {
    pub slab_shape: (usize, usize),
    /// Pixels per metre
    pub resolution: f64,
    pub coffset: f64,
    pub camera_length: CameraLength,
    /// Photon energy in eV declared by the geometry, if any
    pub photon_energy: Option<f64>,
}

impl GeometryInfo {
    pub fn from_detector(detector: &Detector) -> Self {
        let camera_length = detector
            .panels()
            .first()
            .map(|p| p.camera_length.clone())
            .unwrap_or(CameraLength::Fixed(0.0));
        Self {
            slab_shape: detector.slab_shape(),
            resolution: detector.resolution(),
            coffset: detector.coffset(),
            camera_length,
            photon_energy: detector.photon_energy,
        }
    }

    /// Camera length in metres when the geometry fixes it
    pub fn fixed_camera_length(&self) -> Option<f64> {
        match self.camera_length {
            CameraLength::Fixed(clen) => Some(clen),
            CameraLength::FromMetadata(_) => None,
        }
    }
}

/// The peak-finding kernel. Takes a corrected slab image and the bad pixel mask
/// (true is bad) and returns the peaks it found.
pub trait PeakFinder {
    fn find_peaks(
        &self,
        image: &Array2<f32>,
        mask: &Array2<bool>,
    ) -> Result<PeakList, FrameExtractionError>;
}

/// Turns one raw event into a ProcessedFrame. Implementations must not keep state
/// between events.
pub trait FrameProcessor {
    fn process(
        &self,
        event: &RawEvent,
        mask: &Array2<bool>,
        geometry: &GeometryInfo,
    ) -> Result<ProcessedFrame, FrameExtractionError>;
}

/// Local maxima above a flat threshold. A peak is a good pixel which is strictly larger
/// than its earlier neighbours and at least as large as its later ones (raster order),
/// so a plateau yields one peak. Position is the intensity weighted centroid of the 3x3
/// neighbourhood; intensity is its sum.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdPeakFinder {
    pub threshold: f32,
}

impl ThresholdPeakFinder {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn is_local_max(image: &Array2<f32>, ss: usize, fs: usize) -> bool {
        let value = image[[ss, fs]];
        for dss in 0..3 {
            for dfs in 0..3 {
                if dss == 1 && dfs == 1 {
                    continue;
                }
                let neighbour = image[[ss + dss - 1, fs + dfs - 1]];
                let earlier = dss < 1 || (dss == 1 && dfs < 1);
                if (earlier && neighbour >= value) || (!earlier && neighbour > value) {
                    return false;
                }
            }
        }
        true
    }
}

impl PeakFinder for ThresholdPeakFinder {
    fn find_peaks(
        &self,
        image: &Array2<f32>,
        mask: &Array2<bool>,
    ) -> Result<PeakList, FrameExtractionError> {
        if image.dim() != mask.dim() {
            return Err(FrameExtractionError::PeakFinder(format!(
                "mask shape {:?} does not match image shape {:?}",
                mask.dim(),
                image.dim()
            )));
        }
        let (height, width) = image.dim();
        let mut peaks = PeakList::default();
        if height < 3 || width < 3 {
            return Ok(peaks);
        }

        for ss in 1..height - 1 {
            for fs in 1..width - 1 {
                if mask[[ss, fs]] || image[[ss, fs]] <= self.threshold {
                    continue;
                }
                if !Self::is_local_max(image, ss, fs) {
                    continue;
                }
                let mut total = 0.0_f64;
                let mut sum_fs = 0.0_f64;
                let mut sum_ss = 0.0_f64;
                for pss in ss - 1..=ss + 1 {
                    for pfs in fs - 1..=fs + 1 {
                        if mask[[pss, pfs]] {
                            continue;
                        }
                        let value = image[[pss, pfs]] as f64;
                        total += value;
                        sum_fs += value * pfs as f64;
                        sum_ss += value * pss as f64;
                    }
                }
                if total > 0.0 {
                    peaks.push(sum_fs / total, sum_ss / total, total);
                } else {
                    peaks.push(fs as f64, ss as f64, total);
                }
            }
        }
        Ok(peaks)
    }
}

/// Correction, peak finding and hit classification for crystallography frames
#[derive(Debug, Clone)]
pub struct CrystallographyProcessor<P: PeakFinder> {
    finder: P,
    config: ProcessingConfig,
}

impl<P: PeakFinder> CrystallographyProcessor<P> {
    pub fn new(finder: P, config: &ProcessingConfig) -> Self {
        Self {
            finder,
            config: config.clone(),
        }
    }

    pub fn is_hit(&self, num_peaks: usize) -> bool {
        (self.config.min_num_peaks_for_hit..=self.config.max_num_peaks_for_hit)
            .contains(&num_peaks)
    }
}

impl<P: PeakFinder> FrameProcessor for CrystallographyProcessor<P> {
    fn process(
        &self,
        event: &RawEvent,
        mask: &Array2<bool>,
        geometry: &GeometryInfo,
    ) -> Result<ProcessedFrame, FrameExtractionError> {
        let mut image = decode_frame(&event.id, &event.payload, geometry.slab_shape)?;
        image.zip_mut_with(mask, |value, bad| {
            if *bad || !value.is_finite() {
                *value = 0.0;
            }
        });

        let mut peak_list = self.finder.find_peaks(&image, mask)?;
        let num_peaks = peak_list.len();
        let hit = self.is_hit(num_peaks);
        peak_list.truncate(self.config.max_num_peaks);

        let (height, width) = image.dim();
        let mut saturated = false;
        let mut max_peak_value = 0.0_f64;
        for (fs, ss, _) in peak_list.iter() {
            let row = (ss.round() as usize).min(height.saturating_sub(1));
            let col = (fs.round() as usize).min(width.saturating_sub(1));
            let value = image[[row, col]];
            max_peak_value = max_peak_value.max(value as f64);
            if value > self.config.saturation_value {
                saturated = true;
            }
        }

        let mut metrics = BTreeMap::new();
        metrics.insert(String::from("num_peaks"), num_peaks as f64);
        metrics.insert(String::from("max_peak_value"), max_peak_value);
        metrics.insert(
            String::from("total_intensity"),
            image.iter().map(|v| *v as f64).sum(),
        );

        Ok(ProcessedFrame {
            event_id: event.id.clone(),
            timestamp: event.unix_timestamp(),
            peak_list,
            hit,
            saturated,
            beam_energy: event.metadata.beam_energy.or(geometry.photon_energy),
            detector_distance: event
                .metadata
                .detector_distance
                .or(geometry.fixed_camera_length()),
            metrics,
            detector_image: Some(image),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, EventMetadata};
    use crate::geometry::tests::TWO_PANEL_GEOMETRY;
    use approx::assert_relative_eq;
    use time::OffsetDateTime;

    fn event_from(image: &Array2<f32>, metadata: EventMetadata) -> RawEvent {
        RawEvent {
            id: String::from("test//0"),
            payload: encode_frame(image),
            timestamp: OffsetDateTime::now_utc(),
            metadata,
        }
    }

    fn geometry() -> GeometryInfo {
        GeometryInfo::from_detector(&Detector::load(TWO_PANEL_GEOMETRY).unwrap())
    }

    fn config(min_peaks: usize) -> ProcessingConfig {
        ProcessingConfig {
            peak_threshold: 50.0,
            min_num_peaks_for_hit: min_peaks,
            max_num_peaks_for_hit: 100,
            max_num_peaks: 100,
            saturation_value: 1000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_peak_centroid() {
        let mut image = Array2::zeros((20, 10));
        image[[5, 4]] = 100.0;
        image[[5, 5]] = 100.0;
        let mask = Array2::from_elem((20, 10), false);
        let peaks = ThresholdPeakFinder::new(50.0)
            .find_peaks(&image, &mask)
            .unwrap();
        assert_eq!(peaks.len(), 1);
        assert_relative_eq!(peaks.fs[0], 4.5);
        assert_relative_eq!(peaks.ss[0], 5.0);
        assert_relative_eq!(peaks.intensity[0], 200.0);
    }

    #[test]
    fn test_masked_pixels_are_ignored() {
        let mut image = Array2::zeros((20, 10));
        image[[5, 5]] = 100.0;
        let mut mask = Array2::from_elem((20, 10), false);
        mask[[5, 5]] = true;
        let peaks = ThresholdPeakFinder::new(50.0)
            .find_peaks(&image, &mask)
            .unwrap();
        assert!(peaks.is_empty());
    }

    #[test]
    fn test_hit_and_saturation() {
        let mut image = Array2::from_elem((20, 10), 1.0_f32);
        image[[3, 3]] = 200.0;
        image[[12, 6]] = 5000.0;
        let mask = Array2::from_elem((20, 10), false);
        let processor = CrystallographyProcessor::new(ThresholdPeakFinder::new(50.0), &config(2));
        let frame = processor
            .process(&event_from(&image, EventMetadata::default()), &mask, &geometry())
            .unwrap();
        assert!(frame.hit);
        assert!(frame.saturated);
        assert_eq!(frame.peak_list.len(), 2);
        assert_relative_eq!(frame.metrics["num_peaks"], 2.0);
        // beam distance falls back to the fixed clen of the geometry
        assert_eq!(frame.detector_distance, Some(0.1));
    }

    #[test]
    fn test_non_hit_below_minimum() {
        let mut image = Array2::from_elem((20, 10), 1.0_f32);
        image[[3, 3]] = 200.0;
        let mask = Array2::from_elem((20, 10), false);
        let processor = CrystallographyProcessor::new(ThresholdPeakFinder::new(50.0), &config(2));
        let metadata = EventMetadata {
            beam_energy: Some(9000.0),
            detector_distance: Some(0.2),
        };
        let frame = processor
            .process(&event_from(&image, metadata), &mask, &geometry())
            .unwrap();
        assert!(!frame.hit);
        assert!(!frame.saturated);
        assert_eq!(frame.beam_energy, Some(9000.0));
        assert_eq!(frame.detector_distance, Some(0.2));
    }

    #[test]
    fn test_wrong_payload_is_an_error() {
        let image = Array2::from_elem((4, 4), 1.0_f32);
        let mask = Array2::from_elem((20, 10), false);
        let processor = CrystallographyProcessor::new(ThresholdPeakFinder::new(50.0), &config(1));
        assert!(matches!(
            processor.process(&event_from(&image, EventMetadata::default()), &mask, &geometry()),
            Err(FrameExtractionError::PayloadSize { .. })
        ));
    }
}

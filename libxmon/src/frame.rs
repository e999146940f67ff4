use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::FrameExtractionError;

const BYTES_PER_PIXEL: usize = 4;

/// Per-event beam information, when the source knows it
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventMetadata {
    /// Photon energy in eV
    pub beam_energy: Option<f64>,
    /// Sample to detector distance in m
    pub detector_distance: Option<f64>,
}

/// One unprocessed event as handed out by an EventSource.
///
/// The payload is opaque to everything except the FrameProcessor.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub id: String,
    pub payload: Vec<u8>,
    pub timestamp: OffsetDateTime,
    pub metadata: EventMetadata,
}

impl RawEvent {
    /// Age of the event relative to `now`. Negative ages (clock skew) count as zero.
    pub fn age(&self, now: OffsetDateTime) -> std::time::Duration {
        let age = now - self.timestamp;
        std::time::Duration::try_from(age).unwrap_or_default()
    }

    pub fn unix_timestamp(&self) -> f64 {
        self.timestamp.unix_timestamp_nanos() as f64 * 1.0e-9
    }
}

/// Peaks as parallel arrays of fast-scan, slow-scan and integrated intensity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakList {
    pub fs: Vec<f64>,
    pub ss: Vec<f64>,
    pub intensity: Vec<f64>,
}

impl PeakList {
    pub fn push(&mut self, fs: f64, ss: f64, intensity: f64) {
        self.fs.push(fs);
        self.ss.push(ss);
        self.intensity.push(intensity);
    }

    pub fn len(&self) -> usize {
        self.intensity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensity.is_empty()
    }

    /// Iterate over (fs, ss, intensity) triples
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.fs
            .iter()
            .zip(self.ss.iter())
            .zip(self.intensity.iter())
            .map(|((fs, ss), i)| (*fs, *ss, *i))
    }

    /// Keep only the first `max` peaks
    pub fn truncate(&mut self, max: usize) {
        self.fs.truncate(max);
        self.ss.truncate(max);
        self.intensity.truncate(max);
    }
}

/// The result of processing one event on a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFrame {
    pub event_id: String,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub peak_list: PeakList,
    pub hit: bool,
    pub saturated: bool,
    /// Photon energy in eV
    pub beam_energy: Option<f64>,
    /// Detector distance in m
    pub detector_distance: Option<f64>,
    /// Scalar by-products of processing (peak counts, maximum intensity, ...)
    pub metrics: BTreeMap<String, f64>,
    /// Corrected slab image, only present when the worker decided to ship it
    pub detector_image: Option<Array2<f32>>,
}

/// Number of payload bytes for one slab-shaped frame
pub fn frame_size_bytes(shape: (usize, usize)) -> usize {
    shape.0 * shape.1 * BYTES_PER_PIXEL
}

/// Serialize a slab image to the raw little-endian f32 layout sources hand out
pub fn encode_frame(image: &Array2<f32>) -> Vec<u8> {
    let values: Vec<f32> = image.iter().copied().collect();
    let mut bytes = vec![0; values.len() * BYTES_PER_PIXEL];
    LittleEndian::write_f32_into(&values, &mut bytes);
    bytes
}

/// Interpret a raw payload as a slab image of the given shape
pub fn decode_frame(
    event_id: &str,
    payload: &[u8],
    shape: (usize, usize),
) -> Result<Array2<f32>, FrameExtractionError> {
    let expected = frame_size_bytes(shape);
    if payload.len() != expected {
        return Err(FrameExtractionError::PayloadSize {
            event: event_id.to_string(),
            expected,
            found: payload.len(),
        });
    }
    let mut values = vec![0.0_f32; shape.0 * shape.1];
    LittleEndian::read_f32_into(payload, &mut values);
    Ok(Array2::from_shape_vec(shape, values)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_peak_list_iteration() {
        let mut peaks = PeakList::default();
        peaks.push(1.0, 2.0, 30.0);
        peaks.push(4.0, 5.0, 60.0);
        peaks.push(7.0, 8.0, 90.0);
        peaks.truncate(2);
        let collected: Vec<_> = peaks.iter().collect();
        assert_eq!(collected, vec![(1.0, 2.0, 30.0), (4.0, 5.0, 60.0)]);
    }

    #[test]
    fn test_event_age() {
        let now = OffsetDateTime::now_utc();
        let event = RawEvent {
            id: String::from("e0"),
            payload: vec![],
            timestamp: now - Duration::seconds(3),
            metadata: EventMetadata::default(),
        };
        assert_eq!(event.age(now).as_secs(), 3);
        let future = RawEvent {
            timestamp: now + Duration::seconds(3),
            ..event
        };
        assert_eq!(future.age(now), std::time::Duration::ZERO);
    }

    #[test]
    fn test_decode_rejects_wrong_size() {
        let image = Array2::from_shape_fn((3, 4), |(ss, fs)| (ss * 4 + fs) as f32);
        let bytes = encode_frame(&image);
        assert_eq!(bytes.len(), frame_size_bytes((3, 4)));
        assert_eq!(decode_frame("e", &bytes, (3, 4)).unwrap(), image);
        assert!(matches!(
            decode_frame("e", &bytes, (4, 4)),
            Err(FrameExtractionError::PayloadSize { expected: 64, found: 48, .. })
        ));
    }

    #[test]
    fn test_frame_serializes_to_json() {
        let mut peaks = PeakList::default();
        peaks.push(1.0, 2.0, 3.0);
        let frame = ProcessedFrame {
            event_id: String::from("run1//0"),
            timestamp: 1.5,
            peak_list: peaks,
            hit: true,
            saturated: false,
            beam_energy: Some(9000.0),
            detector_distance: None,
            metrics: BTreeMap::from([(String::from("num_peaks"), 1.0)]),
            detector_image: Some(Array2::zeros((2, 3))),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ProcessedFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}

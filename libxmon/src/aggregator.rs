use std::sync::Arc;

use ndarray::Array2;
use serde_json::{json, Value};

use super::config::AggregationConfig;
use super::frame::ProcessedFrame;
use super::pixel_maps::VisualizationPixelMaps;
use super::rolling_window::RollingWindow;

const PLANCK_CONSTANT: f64 = 6.626_070_15e-34;
const SPEED_OF_LIGHT: f64 = 299_792_458.0;
const JOULES_PER_EV: f64 = 1.602_176_634e-19;
const METRES_PER_ANGSTROM: f64 = 1.0e-10;

/// Photon wavelength in metres for an energy in eV
pub fn wavelength(energy_ev: f64) -> f64 {
    PLANCK_CONSTANT * SPEED_OF_LIGHT / (energy_ev * JOULES_PER_EV)
}

/// Radius in pixels of the ring for `resolution_angstrom`, or None when that resolution
/// is beyond what the wavelength can reach (lambda / 2d > 1).
pub fn ring_radius(
    resolution_angstrom: f64,
    energy_ev: f64,
    detector_distance: f64,
    coffset: f64,
    pixels_per_metre: f64,
) -> Option<f64> {
    let d = resolution_angstrom * METRES_PER_ANGSTROM;
    let sin_theta = wavelength(energy_ev) / (2.0 * d);
    if !sin_theta.is_finite() || sin_theta > 1.0 {
        return None;
    }
    let two_theta = 2.0 * sin_theta.asin();
    Some(2.0 * pixels_per_metre * (detector_distance + coffset) * two_theta.tan())
}

fn sanitize(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value
    }
}

fn image_to_json(image: &Array2<f64>) -> Value {
    Value::from(
        image
            .outer_iter()
            .map(|row| Value::from(row.to_vec()))
            .collect::<Vec<Value>>(),
    )
}

/// Rolling statistics and images built up from the stream of processed frames.
///
/// Only the collector loop touches it. Nothing is forgotten except by `reset`, apart
/// from what falls out of the rolling windows.
#[derive(Debug)]
pub struct Aggregator {
    hit_rate: RollingWindow<f64>,
    saturation_rate: RollingWindow<f64>,
    accumulated_image: Array2<f64>,
    event_image: Array2<f64>,
    maps: Arc<VisualizationPixelMaps>,
    slab_width: usize,
    resolution: f64,
    coffset: f64,
    ring_resolutions: Vec<f64>,
    /// None while the beam parameters needed for the rings are unknown
    ring_radii: Option<Vec<Option<f64>>>,
    geometry_is_optimized: bool,
    num_events: u64,
    num_hits: u64,
    last_timestamp: f64,
}

impl Aggregator {
    pub fn new(
        config: &AggregationConfig,
        maps: Arc<VisualizationPixelMaps>,
        slab_width: usize,
        resolution: f64,
        coffset: f64,
    ) -> Self {
        Self {
            hit_rate: RollingWindow::new(config.running_average_window_size),
            saturation_rate: RollingWindow::new(config.running_average_window_size),
            accumulated_image: Array2::zeros(maps.shape),
            event_image: Array2::zeros(maps.shape),
            maps,
            slab_width,
            resolution,
            coffset,
            ring_resolutions: config.resolution_rings.clone(),
            ring_radii: None,
            geometry_is_optimized: config.geometry_is_optimized,
            num_events: 0,
            num_hits: 0,
            last_timestamp: 0.0,
        }
    }

    pub fn ingest(&mut self, frame: &ProcessedFrame) {
        self.num_events += 1;
        if frame.hit {
            self.num_hits += 1;
        }
        self.last_timestamp = frame.timestamp;
        self.hit_rate.push(sanitize(if frame.hit { 1.0 } else { 0.0 }));
        self.saturation_rate
            .push(sanitize(if frame.saturated { 1.0 } else { 0.0 }));

        if frame.hit {
            self.scatter_peaks(frame);
        }

        self.ring_radii = match (frame.beam_energy, frame.detector_distance) {
            (Some(energy), Some(distance)) => Some(
                self.ring_resolutions
                    .iter()
                    .map(|res| ring_radius(*res, energy, distance, self.coffset, self.resolution))
                    .collect(),
            ),
            _ => None,
        };
    }

    fn scatter_peaks(&mut self, frame: &ProcessedFrame) {
        self.event_image.fill(0.0);
        for (fs, ss, intensity) in frame.peak_list.iter() {
            if fs < 0.0 || ss < 0.0 || !fs.is_finite() || !ss.is_finite() {
                continue;
            }
            let (fs, ss) = (fs.round() as usize, ss.round() as usize);
            if fs >= self.slab_width || ss >= self.maps.x.nrows() {
                continue;
            }
            let Some((row, col)) = ss
                .checked_mul(self.slab_width)
                .and_then(|offset| offset.checked_add(fs))
                .and_then(|idx| self.maps.lookup(idx))
            else {
                continue;
            };
            let intensity = sanitize(intensity);
            if let Some(pixel) = self.accumulated_image.get_mut([row, col]) {
                *pixel += intensity;
            }
            if let Some(pixel) = self.event_image.get_mut([row, col]) {
                *pixel += intensity;
            }
        }
    }

    /// Lay a slab image out in visualization space
    pub fn to_visualization(&self, slab_image: &Array2<f32>) -> Array2<f64> {
        let mut image = Array2::zeros(self.maps.shape);
        for (idx, value) in slab_image.iter().enumerate() {
            if let Some((row, col)) = self.maps.lookup(idx) {
                if let Some(pixel) = image.get_mut([row, col]) {
                    *pixel = sanitize(*value as f64);
                }
            }
        }
        image
    }

    /// Payload for the frame topic, when the frame carries an image
    pub fn frame_payload(&self, frame: &ProcessedFrame) -> Option<Value> {
        let slab_image = frame.detector_image.as_ref()?;
        Some(json!({
            "event_id": frame.event_id,
            "timestamp": frame.timestamp,
            "hit": frame.hit,
            "peak_list": {
                "fs": frame.peak_list.fs,
                "ss": frame.peak_list.ss,
                "intensity": frame.peak_list.intensity,
            },
            "detector_image": image_to_json(&self.to_visualization(slab_image)),
        }))
    }

    pub fn snapshot(&self) -> Value {
        let rings = match &self.ring_radii {
            Some(radii) => json!({
                "available": true,
                "resolutions_angstrom": self.ring_resolutions,
                "radii_px": radii,
            }),
            None => json!({
                "available": false,
                "resolutions_angstrom": self.ring_resolutions,
                "radii_px": Value::Null,
            }),
        };
        json!({
            "timestamp": self.last_timestamp,
            "hit_rate": self.hit_rate.average(),
            "saturation_rate": self.saturation_rate.average(),
            "num_events": self.num_events,
            "num_hits": self.num_hits,
            "accumulated_image": image_to_json(&self.accumulated_image),
            "event_image": image_to_json(&self.event_image),
            "resolution_rings": rings,
            "geometry_is_optimized": self.geometry_is_optimized,
        })
    }

    /// Forget everything accumulated so far
    pub fn reset(&mut self) {
        self.hit_rate.clear();
        self.saturation_rate.clear();
        self.accumulated_image.fill(0.0);
        self.event_image.fill(0.0);
        self.ring_radii = None;
        self.num_events = 0;
        self.num_hits = 0;
    }

    pub fn num_events(&self) -> u64 {
        self.num_events
    }

    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    pub fn hit_rate(&self) -> f64 {
        self.hit_rate.average()
    }

    pub fn saturation_rate(&self) -> f64 {
        self.saturation_rate.average()
    }

    pub fn accumulated_image(&self) -> &Array2<f64> {
        &self.accumulated_image
    }

    pub fn event_image(&self) -> &Array2<f64> {
        &self.event_image
    }

    pub fn ring_radii(&self) -> Option<&[Option<f64>]> {
        self.ring_radii.as_deref()
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

/// Structure representing the monitor configuration. Built once at startup and handed
/// by reference to every component that needs it.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub geometry_path: PathBuf,
    pub source: SourceConfig,
    pub processing: ProcessingConfig,
    pub aggregation: AggregationConfig,
    pub broadcast: BroadcastConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            geometry_path: PathBuf::from("detector.geom"),
            source: SourceConfig::default(),
            processing: ProcessingConfig::default(),
            aggregation: AggregationConfig::default(),
            broadcast: BroadcastConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Which event source adapter to use. Selected once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// A directory of raw little-endian f32 frame files
    Files {
        directory: PathBuf,
        extension: String,
        beam_energy: Option<f64>,
        detector_distance: Option<f64>,
    },
    /// Deterministic generated frames, for testing and demonstrations
    Synthetic {
        num_events: usize,
        hit_every: usize,
        peaks_per_hit: usize,
        background: f32,
        peak_height: f32,
        beam_energy: Option<f64>,
        detector_distance: Option<f64>,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Synthetic {
            num_events: 1000,
            hit_every: 4,
            peaks_per_hit: 25,
            background: 10.0,
            peak_height: 500.0,
            beam_energy: Some(9500.0),
            detector_distance: Some(0.1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Pixel value a local maximum must exceed to count as a peak
    pub peak_threshold: f32,
    pub min_num_peaks_for_hit: usize,
    pub max_num_peaks_for_hit: usize,
    /// Peaks beyond this are discarded
    pub max_num_peaks: usize,
    /// Any peak pixel above this marks the frame as saturated
    pub saturation_value: f32,
    /// Ship the detector image with every Nth hit (0 never)
    pub hit_frame_sending_interval: usize,
    /// Ship the detector image with every Nth non-hit (0 never)
    pub non_hit_frame_sending_interval: usize,
    /// Drop events older than this many seconds (live feeds only)
    pub max_event_age: Option<f64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            peak_threshold: 100.0,
            min_num_peaks_for_hit: 10,
            max_num_peaks_for_hit: 2000,
            max_num_peaks: 2048,
            saturation_value: 10000.0,
            hit_frame_sending_interval: 10,
            non_hit_frame_sending_interval: 0,
            max_event_age: None,
        }
    }
}

impl ProcessingConfig {
    pub fn max_event_age(&self) -> Option<Duration> {
        self.max_event_age
            .filter(|age| age.is_finite() && *age >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub running_average_window_size: usize,
    /// Resolution rings to overlay, in Angstrom
    pub resolution_rings: Vec<f64>,
    /// Log the processing speed every N events (0 disables)
    pub speed_report_interval: u64,
    pub geometry_is_optimized: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            running_average_window_size: 10_000,
            resolution_rings: vec![10.0, 6.0, 4.0, 3.0, 2.5, 2.0],
            speed_report_interval: 1000,
            geometry_is_optimized: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Address the publisher binds to
    pub endpoint: String,
    /// Publish a snapshot every N processed events
    pub data_broadcast_interval: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("127.0.0.1:12321"),
            data_broadcast_interval: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Number of ranks, collector included
    pub pool_size: usize,
    /// Address the collector listens on for multi-process pools
    pub collector_address: String,
    /// How long a collector receive waits before checking for an interrupt
    pub poll_interval_ms: u64,
    /// Wait per attempt while collecting shutdown acknowledgements
    pub shutdown_timeout_ms: u64,
    pub shutdown_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            collector_address: String::from("127.0.0.1:12322"),
            poll_interval_ms: 100,
            shutdown_timeout_ms: 1000,
            shutdown_retries: 10,
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Reject values that would make the monitor misbehave rather than fail loudly
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_pool_size_valid() {
            return Err(ConfigError::Invalid(format!(
                "pool_size must be at least 2 (one collector, one worker); got {}",
                self.coordinator.pool_size
            )));
        }
        if self.processing.min_num_peaks_for_hit > self.processing.max_num_peaks_for_hit {
            return Err(ConfigError::Invalid(String::from(
                "min_num_peaks_for_hit is larger than max_num_peaks_for_hit",
            )));
        }
        if self.aggregation.running_average_window_size == 0 {
            return Err(ConfigError::Invalid(String::from(
                "running_average_window_size must be at least 1",
            )));
        }
        if self.broadcast.data_broadcast_interval == 0 {
            return Err(ConfigError::Invalid(String::from(
                "data_broadcast_interval must be at least 1",
            )));
        }
        if let SourceConfig::Synthetic { hit_every: 0, .. } = self.source {
            return Err(ConfigError::Invalid(String::from(
                "hit_every must be at least 1",
            )));
        }
        Ok(())
    }

    pub fn is_pool_size_valid(&self) -> bool {
        self.coordinator.pool_size >= 2
    }

    pub fn num_workers(&self) -> usize {
        self.coordinator.pool_size.saturating_sub(1)
    }
}

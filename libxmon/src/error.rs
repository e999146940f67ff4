use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeometryParseError {
    #[error("Failed to read geometry description due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Geometry line {0} is not of the form `key = value`: {1:?}")]
    BadLine(usize, String),
    #[error("Geometry key {key} has a value which is not a valid number: {value:?}")]
    BadNumber { key: String, value: String },
    #[error("Geometry key {key} has an invalid axis description: {value:?}")]
    BadAxis { key: String, value: String },
    #[error("Geometry key {key} has an invalid dimension tag: {value:?}")]
    BadDimension { key: String, value: String },
    #[error("Geometry contains an unrecognized key: {0}")]
    UnknownKey(String),
    #[error("Panel {panel} is missing the required key {key}")]
    MissingKey { panel: String, key: &'static str },
    #[error("Panel {panel} has inverted {axis} bounds (max < min)")]
    InvertedBounds { panel: String, axis: &'static str },
    #[error("Panel {0} has a non-positive resolution")]
    NonPositiveResolution(String),
    #[error("Panel {0} defines both adu_per_eV and adu_per_photon")]
    ConflictingAduConversion(String),
    #[error("Panel {0} has a singular fast-scan/slow-scan basis")]
    SingularBasis(String),
    #[error("Panels {0} and {1} overlap in slab coordinates")]
    OverlappingPanels(String, String),
    #[error("Geometry does not declare any panels")]
    NoPanels,
    #[error("Bad region {0} mixes x/y and fs/ss coordinates")]
    MixedBadRegion(String),
    #[error("Bad region {0} does not fully specify a rectangle")]
    IncompleteBadRegion(String),
    #[error("{owner} references panel {panel} which does not exist")]
    UnknownPanel { owner: String, panel: String },
    #[error("Rigid group collection {collection} references group {group} which does not exist")]
    UnknownRigidGroup { collection: String, group: String },
    #[error("Panel {panel} has an ambiguous dimension structure: {reason}")]
    AmbiguousDimStructure { panel: String, reason: String },
    #[error("Panel {panel} has {found} placeholder dimensions; other panels have {expected}")]
    PlaceholderMismatch {
        panel: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Error)]
pub enum FrameExtractionError {
    #[error("Event {event} carries {found} bytes of frame data; expected {expected}")]
    PayloadSize {
        event: String,
        expected: usize,
        found: usize,
    },
    #[error("Event data could not be decoded due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Event data could not be shaped into a frame: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Peak finder failed: {0}")]
    PeakFinder(String),
}

#[derive(Debug, Error)]
pub enum SourceAccessError {
    #[error("Could not open event source because path {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Event source failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Event source did not find any matching files in {0:?}")]
    NoMatchingFiles(PathBuf),
    #[error("File {path:?} holds {size} bytes which is not a whole number of {frame_bytes} byte frames")]
    TruncatedFile {
        path: PathBuf,
        size: u64,
        frame_bytes: u64,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport to rank {0} was disconnected")]
    Disconnected(usize),
    #[error("Transport failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Transport failed to encode or decode a payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Transport received a frame of unknown kind {0}")]
    UnknownKind(u8),
    #[error("Transport was asked to address rank {0} which is outside the pool")]
    InvalidRank(usize),
    #[error("Transport handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Coordinator failed due to transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Coordinator gave up waiting for {0} worker(s) to acknowledge shutdown")]
    ShutdownTimeout(usize),
    #[error("Coordinator needs at least two ranks (one collector, one worker); pool size is {0}")]
    PoolTooSmall(usize),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Broadcaster failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Broadcaster failed to serialize a payload: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Monitor failed due to Geometry error: {0}")]
    GeometryError(#[from] GeometryParseError),
    #[error("Monitor failed due to EventSource error: {0}")]
    SourceError(#[from] SourceAccessError),
    #[error("Monitor failed due to Coordinator error: {0}")]
    CoordinatorError(#[from] CoordinatorError),
    #[error("Monitor failed due to Transport error: {0}")]
    TransportError(#[from] TransportError),
    #[error("Monitor failed due to Broadcaster error: {0}")]
    BroadcastError(#[from] BroadcastError),
    #[error("Monitor failed because rank {0} panicked")]
    RankPanicked(usize),
}

use std::collections::VecDeque;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use time::OffsetDateTime;

use super::config::SourceConfig;
use super::coordinator::partition_work;
use super::error::SourceAccessError;
use super::frame::{encode_frame, frame_size_bytes, EventMetadata, RawEvent};

/// The pull contract every event source adapter implements.
///
/// `next_event` returns None once the source is exhausted. An `Err` item means one unit
/// of work could not be opened; the caller skips it and keeps pulling.
pub trait EventSource {
    fn next_event(&mut self) -> Option<Result<RawEvent, SourceAccessError>>;

    /// Release whatever the source still holds open
    fn close(&mut self) {}
}

/// Any iterator of events can act as a source, which is handy for tests and replays
impl<I> EventSource for I
where
    I: Iterator<Item = Result<RawEvent, SourceAccessError>>,
{
    fn next_event(&mut self) -> Option<Result<RawEvent, SourceAccessError>> {
        self.next()
    }
}

/// The closed set of source adapters, picked from the config at startup
#[derive(Debug)]
pub enum Source {
    Files(FileListSource),
    Synthetic(SyntheticSource),
}

impl Source {
    /// Open this rank's share of the configured source
    pub fn open(
        config: &SourceConfig,
        slab_shape: (usize, usize),
        rank: usize,
        pool_size: usize,
    ) -> Result<Self, SourceAccessError> {
        match config {
            SourceConfig::Files {
                directory,
                extension,
                beam_energy,
                detector_distance,
            } => Ok(Self::Files(FileListSource::new(
                directory,
                extension,
                frame_size_bytes(slab_shape),
                EventMetadata {
                    beam_energy: *beam_energy,
                    detector_distance: *detector_distance,
                },
                rank,
                pool_size,
            )?)),
            SourceConfig::Synthetic {
                num_events,
                hit_every,
                peaks_per_hit,
                background,
                peak_height,
                beam_energy,
                detector_distance,
            } => Ok(Self::Synthetic(SyntheticSource {
                events: partition_work(*num_events, pool_size, rank),
                slab_shape,
                hit_every: (*hit_every).max(1),
                peaks_per_hit: *peaks_per_hit,
                background: *background,
                peak_height: *peak_height,
                metadata: EventMetadata {
                    beam_energy: *beam_energy,
                    detector_distance: *detector_distance,
                },
            })),
        }
    }
}

impl EventSource for Source {
    fn next_event(&mut self) -> Option<Result<RawEvent, SourceAccessError>> {
        match self {
            Self::Files(source) => source.next_event(),
            Self::Synthetic(source) => source.next_event(),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Files(source) => source.close(),
            Self::Synthetic(source) => source.close(),
        }
    }
}

/// A file currently being read, with the frames it holds
#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    data: Vec<u8>,
    n_frames: usize,
    next_frame: usize,
    timestamp: OffsetDateTime,
}

/// Raw frame files in a directory. Each file holds one or more slab-shaped frames of
/// little-endian f32 stacked along the placeholder axis.
///
/// The sorted file list is split between the workers; each worker only sees its slice.
#[derive(Debug)]
pub struct FileListSource {
    pub file_stack: VecDeque<PathBuf>,
    active_file: Option<ActiveFile>,
    frame_bytes: usize,
    metadata: EventMetadata,
    pub total_stack_size_bytes: u64,
}

impl FileListSource {
    pub fn new(
        directory: &Path,
        extension: &str,
        frame_bytes: usize,
        metadata: EventMetadata,
        rank: usize,
        pool_size: usize,
    ) -> Result<Self, SourceAccessError> {
        let file_list = Self::get_file_list(directory, extension)?;
        let slice = partition_work(file_list.len(), pool_size, rank);
        let file_stack: VecDeque<PathBuf> = file_list[slice].to_vec().into();
        let total_stack_size_bytes = file_stack
            .iter()
            .map(|path| path.metadata().map(|m| m.len()).unwrap_or(0))
            .sum();
        log::info!(
            "Rank {rank} claimed {} file(s) with total size {}",
            file_stack.len(),
            human_bytes::human_bytes(total_stack_size_bytes as f64)
        );
        Ok(Self {
            file_stack,
            active_file: None,
            frame_bytes,
            metadata,
            total_stack_size_bytes,
        })
    }

    /// All files in the directory with the given extension, sorted by name
    fn get_file_list(directory: &Path, extension: &str) -> Result<Vec<PathBuf>, SourceAccessError> {
        if !directory.exists() {
            return Err(SourceAccessError::BadFilePath(directory.to_path_buf()));
        }
        let mut file_list: Vec<PathBuf> = Vec::new();
        for item in directory.read_dir()? {
            let item_path = item?.path();
            if item_path.is_file()
                && item_path.extension().and_then(|e| e.to_str()) == Some(extension)
            {
                file_list.push(item_path);
            }
        }
        if file_list.is_empty() {
            return Err(SourceAccessError::NoMatchingFiles(directory.to_path_buf()));
        }
        file_list.sort();
        Ok(file_list)
    }

    fn open_file(&self, path: &Path) -> Result<ActiveFile, SourceAccessError> {
        let data = std::fs::read(path)?;
        let size = data.len() as u64;
        if self.frame_bytes == 0 || data.len() % self.frame_bytes != 0 {
            return Err(SourceAccessError::TruncatedFile {
                path: path.to_path_buf(),
                size,
                frame_bytes: self.frame_bytes as u64,
            });
        }
        let timestamp = match path.metadata().and_then(|m| m.modified()) {
            Ok(modified) => OffsetDateTime::from(modified),
            Err(_) => OffsetDateTime::now_utc(),
        };
        Ok(ActiveFile {
            path: path.to_path_buf(),
            n_frames: data.len() / self.frame_bytes,
            data,
            next_frame: 0,
            timestamp,
        })
    }
}

impl EventSource for FileListSource {
    fn next_event(&mut self) -> Option<Result<RawEvent, SourceAccessError>> {
        loop {
            if let Some(active) = self.active_file.as_mut() {
                if active.next_frame < active.n_frames {
                    let start = active.next_frame * self.frame_bytes;
                    let event = RawEvent {
                        id: format!("{}//{}", active.path.display(), active.next_frame),
                        payload: active.data[start..start + self.frame_bytes].to_vec(),
                        timestamp: active.timestamp,
                        metadata: self.metadata,
                    };
                    active.next_frame += 1;
                    return Some(Ok(event));
                }
                self.active_file = None;
            }

            let path = self.file_stack.pop_front()?;
            match self.open_file(&path) {
                Ok(active) => self.active_file = Some(active),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn close(&mut self) {
        self.active_file = None;
        self.file_stack.clear();
    }
}

/// Generated frames: flat background everywhere, with a handful of sharp spots on
/// every `hit_every`-th event. Spot positions are a pure function of the event index,
/// so every run produces the same data.
#[derive(Debug)]
pub struct SyntheticSource {
    events: Range<usize>,
    slab_shape: (usize, usize),
    hit_every: usize,
    peaks_per_hit: usize,
    background: f32,
    peak_height: f32,
    metadata: EventMetadata,
}

impl SyntheticSource {
    pub fn is_hit(&self, index: usize) -> bool {
        index % self.hit_every == 0
    }

    fn generate(&self, index: usize) -> Array2<f32> {
        let (height, width) = self.slab_shape;
        let mut image = Array2::from_elem(self.slab_shape, self.background);
        if !self.is_hit(index) || height < 3 || width < 3 {
            return image;
        }
        let mut state = index as u64 + 1;
        for _ in 0..self.peaks_per_hit {
            let ss = 1 + (next_random(&mut state) as usize) % (height - 2);
            let fs = 1 + (next_random(&mut state) as usize) % (width - 2);
            for dss in 0..3 {
                for dfs in 0..3 {
                    let value = if dss == 1 && dfs == 1 {
                        self.peak_height
                    } else {
                        self.peak_height * 0.25
                    };
                    let pixel = &mut image[[ss + dss - 1, fs + dfs - 1]];
                    *pixel = pixel.max(value);
                }
            }
        }
        image
    }
}

impl EventSource for SyntheticSource {
    fn next_event(&mut self) -> Option<Result<RawEvent, SourceAccessError>> {
        let index = self.events.next()?;
        Some(Ok(RawEvent {
            id: format!("synthetic//{index}"),
            payload: encode_frame(&self.generate(index)),
            timestamp: OffsetDateTime::now_utc(),
            metadata: self.metadata,
        }))
    }

    fn close(&mut self) {
        self.events = self.events.end..self.events.end;
    }
}

/// 64-bit LCG, upper bits only
fn next_random(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407);
    *state >> 33
}

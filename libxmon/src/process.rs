use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use ndarray::Array2;

use super::aggregator::Aggregator;
use super::broadcaster::Broadcaster;
use super::config::Config;
use super::coordinator::{Collector, CollectorSummary, Worker, WorkerSummary, COLLECTOR_RANK};
use super::error::{CoordinatorError, GeometryParseError, MonitorError, SourceAccessError};
use super::frame::RawEvent;
use super::geometry::Detector;
use super::monitor::Monitor;
use super::pixel_maps::{
    compute_pixel_maps, compute_visualization_pixel_maps, PixelMaps, VisualizationPixelMaps,
};
use super::processor::{CrystallographyProcessor, GeometryInfo, ThresholdPeakFinder};
use super::source::Source;
use super::tcp_transport::TcpTransport;
use super::transport::{ChannelTransport, Transport};
use super::worker_status::MonitorStatus;

/// Everything derived from the geometry file. Built once and shared read-only by
/// every rank in the process.
#[derive(Debug, Clone)]
pub struct GeometryContext {
    pub detector: Detector,
    pub info: GeometryInfo,
    pub pixel_maps: PixelMaps,
    pub visualization: Arc<VisualizationPixelMaps>,
    pub mask: Array2<bool>,
}

impl GeometryContext {
    pub fn load(path: &Path) -> Result<Self, GeometryParseError> {
        Ok(Self::from_detector(Detector::from_file(path)?))
    }

    pub fn from_detector(detector: Detector) -> Self {
        let pixel_maps = compute_pixel_maps(&detector);
        let visualization = Arc::new(compute_visualization_pixel_maps(&pixel_maps));
        let mask = detector.bad_pixel_mask(&pixel_maps);
        let info = GeometryInfo::from_detector(&detector);
        Self {
            detector,
            info,
            pixel_maps,
            visualization,
            mask,
        }
    }
}

/// What a rank ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOutcome {
    Collector(CollectorSummary),
    Worker(WorkerSummary),
}

/// Run the collector role: aggregate everything the workers send and broadcast it
pub fn run_collector<T: Transport>(
    config: &Config,
    geometry: &GeometryContext,
    transport: &mut T,
    interrupt: Arc<AtomicBool>,
    status: Option<Sender<MonitorStatus>>,
) -> Result<CollectorSummary, MonitorError> {
    let broadcaster = Broadcaster::bind(&config.broadcast.endpoint)?;
    let aggregator = Aggregator::new(
        &config.aggregation,
        geometry.visualization.clone(),
        geometry.pixel_maps.slab_width(),
        geometry.info.resolution,
        geometry.info.coffset,
    );
    let mut monitor = Monitor::new(config, aggregator, broadcaster);
    if let Some(tx) = status {
        monitor = monitor.with_status(tx);
    }

    let summary = Collector::new(transport, &config.coordinator, interrupt).run(&mut monitor)?;
    if monitor.publisher().dropped_messages() > 0 {
        log::info!(
            "Subscribers missed {} intermediate update(s)",
            monitor.publisher().dropped_messages()
        );
    }
    Ok(summary)
}

/// Run the worker role over this rank's share of the configured source
pub fn run_worker<T: Transport>(
    config: &Config,
    geometry: &GeometryContext,
    transport: &mut T,
) -> Result<WorkerSummary, MonitorError> {
    let rank = transport.rank();
    let pool_size = transport.pool_size();
    let processor = CrystallographyProcessor::new(
        ThresholdPeakFinder::new(config.processing.peak_threshold),
        &config.processing,
    );
    let mut worker = Worker::new(transport, &geometry.info, &geometry.mask, &config.processing);

    let summary = match Source::open(&config.source, geometry.info.slab_shape, rank, pool_size) {
        Ok(mut source) => worker.run(&mut source, &processor)?,
        Err(e) => {
            // still take part in the protocol so the collector can finish
            log::error!("Rank {rank} could not open its event source: {e}");
            let mut empty = std::iter::empty::<Result<RawEvent, SourceAccessError>>();
            worker.run(&mut empty, &processor)?
        }
    };
    Ok(summary)
}

/// Run whichever role this transport's rank has
pub fn process_rank<T: Transport>(
    config: &Config,
    geometry: &GeometryContext,
    transport: &mut T,
    interrupt: Arc<AtomicBool>,
    status: Option<Sender<MonitorStatus>>,
) -> Result<RankOutcome, MonitorError> {
    if transport.rank() == COLLECTOR_RANK {
        run_collector(config, geometry, transport, interrupt, status).map(RankOutcome::Collector)
    } else {
        run_worker(config, geometry, transport).map(RankOutcome::Worker)
    }
}

/// Run a whole pool inside this process: the collector on the calling thread and every
/// worker on its own thread, linked by channels.
pub fn run_local_pool(
    config: &Config,
    interrupt: Arc<AtomicBool>,
    status: Option<Sender<MonitorStatus>>,
) -> Result<CollectorSummary, MonitorError> {
    let geometry = GeometryContext::load(&config.geometry_path)?;
    run_local_pool_with(config, &geometry, interrupt, status)
}

/// As run_local_pool, with an already loaded geometry
pub fn run_local_pool_with(
    config: &Config,
    geometry: &GeometryContext,
    interrupt: Arc<AtomicBool>,
    status: Option<Sender<MonitorStatus>>,
) -> Result<CollectorSummary, MonitorError> {
    let mut transports = ChannelTransport::pool(config.coordinator.pool_size);
    let workers: Vec<ChannelTransport> = transports.drain(1..).collect();
    let Some(mut collector) = transports.pop() else {
        return Err(CoordinatorError::PoolTooSmall(config.coordinator.pool_size).into());
    };
    log::info!(
        "Starting local pool with {} worker thread(s)",
        workers.len()
    );

    std::thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|mut transport| {
                let rank = transport.rank();
                let handle = scope.spawn(move || run_worker(config, geometry, &mut transport));
                (rank, handle)
            })
            .collect();

        let mut result = run_collector(config, geometry, &mut collector, interrupt, status);
        drop(collector);

        for (rank, handle) in handles {
            match handle.join() {
                Ok(Ok(summary)) => log::debug!("Rank {rank} exited with {summary:?}"),
                Ok(Err(e)) => log::error!("Rank {rank} failed: {e}"),
                Err(_) => {
                    log::error!("Rank {rank} panicked");
                    if result.is_ok() {
                        result = Err(MonitorError::RankPanicked(rank));
                    }
                }
            }
        }
        result
    })
}

/// Connect to the pool over TCP as `rank` and run that rank to completion
pub fn run_tcp_rank(
    config: &Config,
    rank: usize,
    interrupt: Arc<AtomicBool>,
    status: Option<Sender<MonitorStatus>>,
) -> Result<RankOutcome, MonitorError> {
    let geometry = GeometryContext::load(&config.geometry_path)?;
    let address = &config.coordinator.collector_address;
    let pool_size = config.coordinator.pool_size;
    let mut transport = if rank == COLLECTOR_RANK {
        TcpTransport::collector(address, pool_size)?
    } else {
        TcpTransport::worker(address, rank, pool_size)?
    };
    process_rank(config, &geometry, &mut transport, interrupt, status)
}

/// Process exit code for a rank's result
pub fn exit_code<T>(result: &Result<T, MonitorError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

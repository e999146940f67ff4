use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bit_set::BitSet;
use ndarray::Array2;
use time::OffsetDateTime;

use super::config::{CoordinatorConfig, ProcessingConfig};
use super::error::{CoordinatorError, TransportError};
use super::frame::ProcessedFrame;
use super::message::{Envelope, Message};
use super::processor::{FrameProcessor, GeometryInfo};
use super::source::EventSource;
use super::transport::{SendRequest, Transport};
use super::worker_status::WorkerState;

pub const COLLECTOR_RANK: usize = 0;

/// The contiguous slice of `total` work units claimed by `rank`.
///
/// Workers are ranks 1..pool_size and each takes ceil(total / workers) units, so the
/// last slices may be short or empty. The collector gets nothing.
pub fn partition_work(total: usize, pool_size: usize, rank: usize) -> Range<usize> {
    if pool_size < 2 || rank == COLLECTOR_RANK || rank >= pool_size {
        return 0..0;
    }
    let slice = total.div_ceil(pool_size - 1);
    let start = ((rank - 1) * slice).min(total);
    let end = (rank * slice).min(total);
    start..end
}

/// Counters a worker returns when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub events_sent: u64,
    pub events_failed: u64,
    pub events_too_old: u64,
    pub source_errors: u64,
    /// True when the worker stopped because the collector asked it to
    pub terminated: bool,
}

/// The worker role: pull, process, send, one event at a time.
///
/// At most one send is ever outstanding. The previous send is always waited on before
/// the next one goes out, so the collector sees each worker's messages in order.
pub struct Worker<'a, T: Transport> {
    transport: &'a mut T,
    geometry: &'a GeometryInfo,
    mask: &'a Array2<bool>,
    config: &'a ProcessingConfig,
    state: WorkerState,
    pending: Option<SendRequest>,
    hits_seen: usize,
    non_hits_seen: usize,
    summary: WorkerSummary,
}

impl<'a, T: Transport> Worker<'a, T> {
    pub fn new(
        transport: &'a mut T,
        geometry: &'a GeometryInfo,
        mask: &'a Array2<bool>,
        config: &'a ProcessingConfig,
    ) -> Self {
        Self {
            transport,
            geometry,
            mask,
            config,
            state: WorkerState::default(),
            pending: None,
            hits_seen: 0,
            non_hits_seen: 0,
            summary: WorkerSummary::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until the source is exhausted or the collector sends Terminate.
    ///
    /// A transport failure ends the worker with an error after one synchronous attempt
    /// to tell the collector it is gone.
    pub fn run<S: EventSource, P: FrameProcessor>(
        &mut self,
        source: &mut S,
        processor: &P,
    ) -> Result<WorkerSummary, CoordinatorError> {
        let rank = self.transport.rank();
        log::info!("Worker rank {rank} started");
        let result = self.event_loop(source, processor);
        source.close();
        match result {
            Ok(()) => {
                log::info!(
                    "Worker rank {rank} finished after sending {} event(s)",
                    self.summary.events_sent
                );
                Ok(self.summary)
            }
            Err(e) => {
                log::error!("Worker rank {rank} lost its transport: {e}");
                self.pending = None;
                if let Ok(request) = self.transport.isend(COLLECTOR_RANK, Message::End) {
                    let _ = request.wait();
                }
                self.state = WorkerState::Terminated;
                Err(e.into())
            }
        }
    }

    fn event_loop<S: EventSource, P: FrameProcessor>(
        &mut self,
        source: &mut S,
        processor: &P,
    ) -> Result<(), TransportError> {
        let max_age = self.config.max_event_age();
        loop {
            self.state = WorkerState::Fetching;
            if self.terminate_requested()? {
                return self.drain();
            }

            let event = match source.next_event() {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    log::warn!("Skipping unit of work which failed to open: {e}");
                    self.summary.source_errors += 1;
                    continue;
                }
                None => break,
            };

            if let Some(max_age) = max_age {
                let age = event.age(OffsetDateTime::now_utc());
                if age > max_age {
                    log::debug!(
                        "Dropping event {} which is {:.3} s old",
                        event.id,
                        age.as_secs_f64()
                    );
                    self.summary.events_too_old += 1;
                    continue;
                }
            }

            self.state = WorkerState::Processing;
            let mut frame = match processor.process(&event, self.mask, self.geometry) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Failed to process event {}: {e}", event.id);
                    self.summary.events_failed += 1;
                    continue;
                }
            };
            drop(event);
            self.select_image(&mut frame);

            self.state = WorkerState::Sending;
            self.send(Message::Result(Box::new(frame)))?;
            self.summary.events_sent += 1;
        }

        self.send(Message::End)?;
        self.complete_pending()?;
        self.state = WorkerState::Terminated;
        Ok(())
    }

    /// Wait out the previous send, then start this one
    fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.complete_pending()?;
        log::trace!(
            "Rank {} sending {} to collector",
            self.transport.rank(),
            message.name()
        );
        self.pending = Some(self.transport.isend(COLLECTOR_RANK, message)?);
        Ok(())
    }

    fn complete_pending(&mut self) -> Result<(), TransportError> {
        match self.pending.take() {
            Some(request) => request.wait(),
            None => Ok(()),
        }
    }

    /// Non-blocking check for a Terminate from the collector
    fn terminate_requested(&mut self) -> Result<bool, TransportError> {
        while let Some(envelope) = self.transport.poll()? {
            match envelope.message {
                Message::Terminate => return Ok(true),
                other => log::warn!(
                    "Worker rank {} ignoring unexpected {} from rank {}",
                    self.transport.rank(),
                    other.name(),
                    envelope.source
                ),
            }
        }
        Ok(false)
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        log::info!(
            "Worker rank {} received Terminate; draining",
            self.transport.rank()
        );
        self.state = WorkerState::Draining;
        self.send(Message::Terminated)?;
        self.complete_pending()?;
        self.state = WorkerState::Terminated;
        self.summary.terminated = true;
        Ok(())
    }

    /// Keep the detector image only on every Nth hit and every Mth non-hit
    fn select_image(&mut self, frame: &mut ProcessedFrame) {
        let (counter, interval) = if frame.hit {
            (&mut self.hits_seen, self.config.hit_frame_sending_interval)
        } else {
            (
                &mut self.non_hits_seen,
                self.config.non_hit_frame_sending_interval,
            )
        };
        *counter += 1;
        if interval == 0 || *counter % interval != 0 {
            frame.detector_image = None;
        }
    }
}

/// What the collector does with the stream. Driven from the collector loop only, so
/// implementors need no locking.
pub trait CollectorHandler {
    fn on_result(&mut self, source: usize, frame: ProcessedFrame);

    /// A worker sent End or Terminated; `retired` counts distinct workers so far
    fn on_worker_retired(&mut self, _rank: usize, _retired: usize) {}

    /// Every worker has retired
    fn on_end_of_stream(&mut self);

    /// Called after every receive, including ones that timed out
    fn between_messages(&mut self) {}
}

/// Counters the collector returns when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorSummary {
    pub results: u64,
    pub retired: usize,
    pub discarded: u64,
    pub interrupted: bool,
}

/// The collector role (rank 0)
pub struct Collector<'a, T: Transport> {
    transport: &'a mut T,
    config: &'a CoordinatorConfig,
    interrupt: Arc<AtomicBool>,
    retired: BitSet,
    summary: CollectorSummary,
}

impl<'a, T: Transport> Collector<'a, T> {
    pub fn new(
        transport: &'a mut T,
        config: &'a CoordinatorConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let pool_size = transport.pool_size();
        Self {
            transport,
            config,
            interrupt,
            retired: BitSet::with_capacity(pool_size),
            summary: CollectorSummary::default(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.transport.pool_size().saturating_sub(1)
    }

    pub fn retired_workers(&self) -> usize {
        self.retired.len()
    }

    /// Receive until every worker has sent End (or Terminated after an interrupt)
    pub fn run<H: CollectorHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<CollectorSummary, CoordinatorError> {
        let pool_size = self.transport.pool_size();
        if pool_size < 2 {
            return Err(CoordinatorError::PoolTooSmall(pool_size));
        }
        log::info!("Collector waiting on {} worker(s)", self.num_workers());

        while self.retired.len() < self.num_workers() {
            if self.interrupt.load(Ordering::Relaxed) {
                log::info!("Collector interrupted; shutting down workers");
                self.shutdown(handler)?;
                break;
            }
            match self.transport.recv_any_timeout(self.config.poll_interval()) {
                Ok(Some(envelope)) => self.handle(envelope, handler),
                Ok(None) => (),
                Err(e) => {
                    log::error!("Collector lost its transport: {e}");
                    self.broadcast_terminate();
                    return Err(e.into());
                }
            }
            handler.between_messages();
        }

        log::info!(
            "End of stream after {} result(s) from {} worker(s)",
            self.summary.results,
            self.retired.len()
        );
        handler.on_end_of_stream();
        self.summary.retired = self.retired.len();
        Ok(self.summary)
    }

    fn handle<H: CollectorHandler>(&mut self, envelope: Envelope, handler: &mut H) {
        let Envelope { source, message } = envelope;
        if source == COLLECTOR_RANK || source >= self.transport.pool_size() {
            log::warn!("Collector ignoring message from out-of-pool rank {source}");
            return;
        }
        match message {
            Message::Result(frame) => {
                if self.retired.contains(source) {
                    log::warn!(
                        "Discarding result {} from rank {source} which already retired",
                        frame.event_id
                    );
                    self.summary.discarded += 1;
                    return;
                }
                self.summary.results += 1;
                handler.on_result(source, *frame);
            }
            Message::End | Message::Terminated => {
                if self.retired.insert(source) {
                    log::info!(
                        "Rank {source} retired with {} ({}/{})",
                        message.name(),
                        self.retired.len(),
                        self.num_workers()
                    );
                    handler.on_worker_retired(source, self.retired.len());
                } else {
                    log::debug!("Ignoring repeated {} from rank {source}", message.name());
                }
            }
            Message::Terminate => {
                log::warn!("Collector ignoring Terminate from rank {source}");
            }
        }
    }

    /// Best effort: tell every worker still running to stop, ignoring failures
    fn broadcast_terminate(&mut self) {
        for rank in 1..self.transport.pool_size() {
            if self.retired.contains(rank) {
                continue;
            }
            if let Err(e) = self.transport.isend(rank, Message::Terminate) {
                log::debug!("Could not send Terminate to rank {rank}: {e}");
            }
        }
    }

    /// Send Terminate and wait for every worker to retire, retrying a timed receive
    fn shutdown<H: CollectorHandler>(&mut self, handler: &mut H) -> Result<(), CoordinatorError> {
        self.summary.interrupted = true;
        self.broadcast_terminate();

        let mut attempts = 0;
        while self.retired.len() < self.num_workers() {
            if attempts >= self.config.shutdown_retries {
                let remaining = self.num_workers() - self.retired.len();
                log::error!("{remaining} worker(s) never acknowledged Terminate");
                return Err(CoordinatorError::ShutdownTimeout(remaining));
            }
            match self
                .transport
                .recv_any_timeout(self.config.shutdown_timeout())?
            {
                Some(envelope) => self.handle(envelope, handler),
                None => attempts += 1,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FrameExtractionError, SourceAccessError};
    use crate::frame::{EventMetadata, PeakList, RawEvent};
    use crate::geometry::CameraLength;
    use crate::transport::ChannelTransport;
    use std::collections::BTreeMap;
    use std::sync::mpsc::{channel, Sender};
    use std::time::Duration;

    /// Wraps a channel transport and checks, on every send, that the previous send's
    /// completion handle was already consumed.
    struct RecordingTransport {
        inner: ChannelTransport,
        last_ack: Option<Sender<Result<(), TransportError>>>,
        sent: Vec<&'static str>,
        overlapping_sends: usize,
    }

    impl RecordingTransport {
        fn new(inner: ChannelTransport) -> Self {
            Self {
                inner,
                last_ack: None,
                sent: vec![],
                overlapping_sends: 0,
            }
        }
    }

    impl Transport for RecordingTransport {
        fn rank(&self) -> usize {
            self.inner.rank()
        }

        fn pool_size(&self) -> usize {
            self.inner.pool_size()
        }

        fn isend(&mut self, dest: usize, message: Message) -> Result<SendRequest, TransportError> {
            if let Some(previous) = self.last_ack.take() {
                // still deliverable means the worker never waited on it
                if previous.send(Ok(())).is_ok() {
                    self.overlapping_sends += 1;
                }
            }
            self.sent.push(message.name());
            // the inner send completes only once the peer reads it; the test reads later
            drop(self.inner.isend(dest, message)?);
            let (ack, completion) = channel();
            ack.send(Ok(())).unwrap();
            self.last_ack = Some(ack);
            Ok(SendRequest::new(dest, completion))
        }

        fn recv_any(&mut self) -> Result<Envelope, TransportError> {
            self.inner.recv_any()
        }

        fn recv_any_timeout(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<Envelope>, TransportError> {
            self.inner.recv_any_timeout(timeout)
        }

        fn poll(&mut self) -> Result<Option<Envelope>, TransportError> {
            self.inner.poll()
        }
    }

    /// Marks every third event a hit and fails on events whose id ends in "bad"
    struct StubProcessor;

    impl FrameProcessor for StubProcessor {
        fn process(
            &self,
            event: &RawEvent,
            _mask: &Array2<bool>,
            _geometry: &GeometryInfo,
        ) -> Result<ProcessedFrame, FrameExtractionError> {
            if event.id.ends_with("bad") {
                return Err(FrameExtractionError::PeakFinder(String::from("stub")));
            }
            let index: usize = event.id.parse().unwrap_or(1);
            Ok(ProcessedFrame {
                event_id: event.id.clone(),
                timestamp: event.unix_timestamp(),
                peak_list: PeakList::default(),
                hit: index % 3 == 0,
                saturated: false,
                beam_energy: None,
                detector_distance: None,
                metrics: BTreeMap::new(),
                detector_image: Some(Array2::zeros((2, 2))),
            })
        }
    }

    fn events(ids: &[&str]) -> impl EventSource {
        ids.iter()
            .map(|id| {
                Ok(RawEvent {
                    id: id.to_string(),
                    payload: vec![],
                    timestamp: OffsetDateTime::now_utc(),
                    metadata: EventMetadata::default(),
                })
            })
            .collect::<Vec<Result<RawEvent, SourceAccessError>>>()
            .into_iter()
    }

    fn geometry() -> GeometryInfo {
        GeometryInfo {
            slab_shape: (2, 2),
            resolution: 1.0,
            coffset: 0.0,
            camera_length: CameraLength::Fixed(0.1),
            photon_energy: None,
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        results: Vec<(usize, String)>,
        images: usize,
        ended: bool,
    }

    impl CollectorHandler for CountingHandler {
        fn on_result(&mut self, source: usize, frame: ProcessedFrame) {
            assert!(!self.ended);
            if frame.detector_image.is_some() {
                self.images += 1;
            }
            self.results.push((source, frame.event_id));
        }

        fn on_end_of_stream(&mut self) {
            self.ended = true;
        }
    }

    fn coordinator_config() -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval_ms: 5,
            shutdown_timeout_ms: 20,
            shutdown_retries: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_covers_everything_once() {
        assert_eq!(partition_work(10, 4, 1), 0..4);
        assert_eq!(partition_work(10, 4, 2), 4..8);
        assert_eq!(partition_work(10, 4, 3), 8..10);
        assert_eq!(partition_work(10, 4, 0), 0..0);
        assert_eq!(partition_work(2, 4, 3), 2..2);
        assert_eq!(partition_work(5, 1, 1), 0..0);
        for pool_size in 2..7 {
            let covered: Vec<usize> = (1..pool_size)
                .flat_map(|rank| partition_work(17, pool_size, rank))
                .collect();
            assert_eq!(covered, (0..17).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_worker_never_overlaps_sends() {
        let mut pool = ChannelTransport::pool(2);
        let worker_end = pool.pop().unwrap();
        let mut collector_end = pool.pop().unwrap();
        let mut transport = RecordingTransport::new(worker_end);
        let config = ProcessingConfig {
            hit_frame_sending_interval: 2,
            non_hit_frame_sending_interval: 0,
            ..Default::default()
        };
        let geometry = geometry();
        let mask = Array2::from_elem((2, 2), false);

        let mut source = events(&["1", "2", "3", "4bad", "5", "6"]);
        let summary = Worker::new(&mut transport, &geometry, &mask, &config)
            .run(&mut source, &StubProcessor)
            .unwrap();

        assert_eq!(transport.overlapping_sends, 0);
        assert_eq!(
            transport.sent,
            vec!["Result", "Result", "Result", "Result", "Result", "End"]
        );
        assert_eq!(summary.events_sent, 5);
        assert_eq!(summary.events_failed, 1);
        assert!(!summary.terminated);

        let mut images = 0;
        let mut order = vec![];
        while let Some(envelope) = collector_end.poll().unwrap() {
            if let Message::Result(frame) = envelope.message {
                images += frame.detector_image.is_some() as usize;
                order.push(frame.event_id);
            }
        }
        assert_eq!(order, vec!["1", "2", "3", "5", "6"]);
        // hits are 3 and 6; only the second one keeps its image
        assert_eq!(images, 1);
    }

    #[test]
    fn test_worker_drains_on_terminate() {
        let mut pool = ChannelTransport::pool(2);
        let mut transport = RecordingTransport::new(pool.pop().unwrap());
        let mut collector_end = pool.pop().unwrap();
        let _ = collector_end.isend(1, Message::Terminate).unwrap();

        let config = ProcessingConfig::default();
        let geometry = geometry();
        let mask = Array2::from_elem((2, 2), false);
        let mut source = events(&["1", "2"]);
        let mut worker = Worker::new(&mut transport, &geometry, &mask, &config);
        let summary = worker.run(&mut source, &StubProcessor).unwrap();
        assert!(summary.terminated);
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert_eq!(transport.sent, vec!["Terminated"]);
        assert_eq!(
            collector_end.poll().unwrap(),
            Some(Envelope::new(1, Message::Terminated))
        );
        assert_eq!(collector_end.poll().unwrap(), None);
    }

    #[test]
    fn test_old_events_are_dropped() {
        let mut pool = ChannelTransport::pool(2);
        let mut transport = RecordingTransport::new(pool.pop().unwrap());
        let _collector_end = pool.pop().unwrap();
        let config = ProcessingConfig {
            max_event_age: Some(60.0),
            ..Default::default()
        };
        let geometry = geometry();
        let mask = Array2::from_elem((2, 2), false);
        let stale = RawEvent {
            id: String::from("1"),
            payload: vec![],
            timestamp: OffsetDateTime::now_utc() - time::Duration::hours(1),
            metadata: EventMetadata::default(),
        };
        let mut source = vec![Ok::<_, SourceAccessError>(stale)].into_iter();
        let summary = Worker::new(&mut transport, &geometry, &mask, &config)
            .run(&mut source, &StubProcessor)
            .unwrap();
        assert_eq!(transport.sent, vec!["End"]);
        assert_eq!(summary.events_too_old, 1);
        assert_eq!(summary.events_sent, 0);
    }

    #[test]
    fn test_end_of_stream_needs_every_distinct_worker() {
        let mut pool = ChannelTransport::pool(4);
        let mut workers: Vec<ChannelTransport> = pool.drain(1..).collect();
        let mut collector_end = pool.pop().unwrap();

        // rank 1 retires twice, which must only count once
        let _ = workers[0].isend(0, Message::End).unwrap();
        let _ = workers[0].isend(0, Message::End).unwrap();
        let _ = workers[1].isend(0, Message::End).unwrap();

        let config = coordinator_config();
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = interrupt.clone();
        let collector = std::thread::spawn(move || {
            let mut handler = CountingHandler::default();
            let summary = Collector::new(&mut collector_end, &config, interrupt)
                .run(&mut handler)
                .unwrap();
            (summary, handler)
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!collector.is_finished());
        let _ = workers[2].isend(0, Message::Terminated).unwrap();
        let (summary, handler) = collector.join().unwrap();
        assert!(handler.ended);
        assert_eq!(summary.retired, 3);
        assert!(!summary.interrupted);
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_results_after_retirement_are_discarded() {
        let mut pool = ChannelTransport::pool(3);
        let mut second = pool.pop().unwrap();
        let mut first = pool.pop().unwrap();
        let mut collector_end = pool.pop().unwrap();
        let event = events(&["7"]).next_event().unwrap().unwrap();
        let mask = Array2::from_elem((2, 2), false);
        let frame = StubProcessor.process(&event, &mask, &geometry()).unwrap();

        let _ = first.isend(0, Message::Result(Box::new(frame.clone()))).unwrap();
        let _ = first.isend(0, Message::End).unwrap();
        let _ = first.isend(0, Message::Result(Box::new(frame))).unwrap();
        let _ = second.isend(0, Message::End).unwrap();

        let config = coordinator_config();
        let mut handler = CountingHandler::default();
        let interrupt = Arc::new(AtomicBool::new(false));
        let summary = Collector::new(&mut collector_end, &config, interrupt)
            .run(&mut handler)
            .unwrap();
        assert_eq!(handler.results, vec![(1, String::from("7"))]);
        assert_eq!(summary.discarded, 1);
        assert_eq!(summary.results, 1);
    }

    #[test]
    fn test_interrupt_terminates_workers() {
        let mut pool = ChannelTransport::pool(3);
        let workers: Vec<ChannelTransport> = pool.drain(1..).collect();
        let mut collector_end = pool.pop().unwrap();

        let handles: Vec<_> = workers
            .into_iter()
            .map(|mut transport| {
                std::thread::spawn(move || {
                    let config = ProcessingConfig::default();
                    let geometry = geometry();
                    let mask = Array2::from_elem((2, 2), false);
                    // an endless source; only Terminate stops it
                    let mut source = std::iter::repeat_with(|| {
                        std::thread::sleep(Duration::from_millis(1));
                        Ok::<_, SourceAccessError>(RawEvent {
                            id: String::from("1"),
                            payload: vec![],
                            timestamp: OffsetDateTime::now_utc(),
                            metadata: EventMetadata::default(),
                        })
                    });
                    Worker::new(&mut transport, &geometry, &mask, &config)
                        .run(&mut source, &StubProcessor)
                        .unwrap()
                })
            })
            .collect();

        let config = coordinator_config();
        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = interrupt.clone();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::Relaxed);
        });
        let mut handler = CountingHandler::default();
        let summary = Collector::new(&mut collector_end, &config, interrupt)
            .run(&mut handler)
            .unwrap();
        setter.join().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.retired, 2);
        assert!(handler.ended);
        for handle in handles {
            assert!(handle.join().unwrap().terminated);
        }
    }

    #[test]
    fn test_shutdown_times_out_on_silent_worker() {
        let mut pool = ChannelTransport::pool(2);
        let _silent = pool.pop().unwrap();
        let mut collector_end = pool.pop().unwrap();
        let config = coordinator_config();
        let mut handler = CountingHandler::default();
        let interrupt = Arc::new(AtomicBool::new(true));
        let result = Collector::new(&mut collector_end, &config, interrupt).run(&mut handler);
        assert!(matches!(result, Err(CoordinatorError::ShutdownTimeout(1))));
        assert!(!handler.ended);
    }
}

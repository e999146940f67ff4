use std::sync::mpsc::Sender;
use std::time::Instant;

use super::aggregator::Aggregator;
use super::broadcaster::{ControlRequest, Publish, FRAME_TOPIC, SNAPSHOT_TOPIC};
use super::config::Config;
use super::coordinator::CollectorHandler;
use super::frame::ProcessedFrame;
use super::worker_status::MonitorStatus;

/// The collector side of the monitor: feeds results into the Aggregator and pushes
/// snapshots and frames out through the publisher.
pub struct Monitor<P: Publish> {
    aggregator: Aggregator,
    publisher: P,
    data_broadcast_interval: u64,
    speed_report_interval: u64,
    /// Events seen since startup; unlike the aggregator counters this survives a reset
    processed: u64,
    speed_mark: (Instant, u64),
    status: MonitorStatus,
    status_tx: Option<Sender<MonitorStatus>>,
}

impl<P: Publish> Monitor<P> {
    pub fn new(config: &Config, aggregator: Aggregator, publisher: P) -> Self {
        Self {
            aggregator,
            publisher,
            data_broadcast_interval: config.broadcast.data_broadcast_interval.max(1),
            speed_report_interval: config.aggregation.speed_report_interval,
            processed: 0,
            speed_mark: (Instant::now(), 0),
            status: MonitorStatus::new(0, config.num_workers()),
            status_tx: None,
        }
    }

    /// Report progress to a watcher after every broadcast and retirement
    pub fn with_status(mut self, tx: Sender<MonitorStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    fn publish_snapshot(&mut self) {
        let snapshot = self.aggregator.snapshot();
        if let Err(e) = self.publisher.publish(SNAPSHOT_TOPIC, &snapshot) {
            log::warn!("Failed to publish snapshot: {e}");
        }
        self.send_status();
    }

    fn send_status(&mut self) {
        self.status.events_processed = self.processed;
        self.status.hits = self.aggregator.num_hits();
        if let Some(tx) = &self.status_tx {
            let _ = tx.send(self.status.clone());
        }
    }

    fn report_speed(&mut self) {
        let (since, count) = self.speed_mark;
        let elapsed = since.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            (self.processed - count) as f64 / elapsed
        } else {
            0.0
        };
        log::info!(
            "Processed: {} events in total, {:.2} Hz",
            self.processed,
            rate
        );
        self.speed_mark = (Instant::now(), self.processed);
    }
}

impl<P: Publish> CollectorHandler for Monitor<P> {
    fn on_result(&mut self, source: usize, frame: ProcessedFrame) {
        log::trace!("Result {} from rank {source}", frame.event_id);
        self.aggregator.ingest(&frame);
        self.processed += 1;

        if let Some(payload) = self.aggregator.frame_payload(&frame) {
            if let Err(e) = self.publisher.publish(FRAME_TOPIC, &payload) {
                log::warn!("Failed to publish frame {}: {e}", frame.event_id);
            }
        }
        if self.processed % self.data_broadcast_interval == 0 {
            self.publish_snapshot();
        }
        if self.speed_report_interval > 0 && self.processed % self.speed_report_interval == 0 {
            self.report_speed();
        }
    }

    fn on_worker_retired(&mut self, _rank: usize, retired: usize) {
        self.status.retired_workers = retired;
        self.send_status();
    }

    fn on_end_of_stream(&mut self) {
        self.publish_snapshot();
        log::info!(
            "Stream ended after {} events; {} hits since the last reset",
            self.processed,
            self.aggregator.num_hits()
        );
        self.status.finished = true;
        self.send_status();
    }

    fn between_messages(&mut self) {
        while let Some(request) = self.publisher.poll_control() {
            match request {
                ControlRequest::Reset => {
                    log::info!("Resetting accumulated statistics");
                    self.aggregator.reset();
                }
            }
        }
    }
}

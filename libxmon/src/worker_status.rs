/// Where a worker is in its loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Fetching,
    Processing,
    Sending,
    /// Terminate received; finishing the last send
    Draining,
    Terminated,
}

/// What a rank reports to whoever is watching it (the CLI progress display)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStatus {
    pub rank: usize,
    pub events_processed: u64,
    pub hits: u64,
    pub retired_workers: usize,
    pub num_workers: usize,
    /// Set once the rank is done
    pub finished: bool,
}

impl MonitorStatus {
    pub fn new(rank: usize, num_workers: usize) -> Self {
        Self {
            rank,
            num_workers,
            ..Default::default()
        }
    }

    pub fn hit_rate(&self) -> f64 {
        if self.events_processed == 0 {
            0.0
        } else {
            self.hits as f64 / self.events_processed as f64
        }
    }

    pub fn message(&self) -> String {
        format!(
            "{} events, {} hits ({:.1}%), {}/{} workers done",
            self.events_processed,
            self.hits,
            self.hit_rate() * 100.0,
            self.retired_workers,
            self.num_workers
        )
    }
}

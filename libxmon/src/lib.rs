//! # xmon
//!
//! xmon is a real-time monitor for serial X-ray detector experiments, written in Rust.
//! A pool of worker ranks pulls detector frames from a data source, finds Bragg peaks
//! and classifies hits, while a single collector rank aggregates the results into
//! running statistics (hit rate, saturation rate, accumulated peak images, resolution
//! rings) and broadcasts them to visualization clients over a TCP socket.
//!
//! ## Installation
//!
//! Currently the only method of install is from source.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./xmon_cli` from the top level
//! xmon repository. The binary is installed to your cargo install location (typically
//! something like `~/.cargo/bin/`).
//!
//! ## Running
//!
//! The pool is made of ranks. Rank 0 is the collector, every other rank is a worker, so a
//! pool of size N has N-1 workers. The pool can run in two ways:
//!
//! - `xmon_cli run -p config.yml` runs every rank as a thread of one process.
//! - `xmon_cli rank -p config.yml --rank K` runs a single rank as its own process. Start
//!   rank 0 first; workers connect to `coordinator.collector_address` and announce their
//!   rank.
//! - `xmon_cli listen -e 127.0.0.1:12321` subscribes to a running collector and logs
//!   every snapshot and frame it publishes.
//!
//! Ctrl-C asks the collector to shut the pool down. Every worker finishes the send it is
//! in the middle of, acknowledges, and exits. The process exits with 0 on a clean shutdown
//! and 1 on any unrecoverable error.
//!
//! ## Configuration
//!
//! Configuration is a YAML file; `xmon_cli new -p config.yml` writes a template. Any
//! section left out takes its default values.
//!
//! ```yml
//! geometry_path: detector.geom
//! source:
//!   kind: synthetic
//!   num_events: 1000
//!   hit_every: 4
//!   peaks_per_hit: 25
//!   background: 10.0
//!   peak_height: 500.0
//!   beam_energy: 9500.0
//!   detector_distance: 0.1
//! processing:
//!   peak_threshold: 100.0
//!   min_num_peaks_for_hit: 10
//!   max_num_peaks_for_hit: 2000
//!   max_num_peaks: 2048
//!   saturation_value: 10000.0
//!   hit_frame_sending_interval: 10
//!   non_hit_frame_sending_interval: 0
//!   max_event_age: null
//! aggregation:
//!   running_average_window_size: 10000
//!   resolution_rings: [10.0, 6.0, 4.0, 3.0, 2.5, 2.0]
//!   speed_report_interval: 1000
//!   geometry_is_optimized: false
//! broadcast:
//!   endpoint: 127.0.0.1:12321
//!   data_broadcast_interval: 10
//! coordinator:
//!   pool_size: 4
//!   collector_address: 127.0.0.1:12322
//!   poll_interval_ms: 100
//!   shutdown_timeout_ms: 1000
//!   shutdown_retries: 10
//! ```
//!
//! A `files` source reads every file with the given `extension` in `directory`. Each
//! file holds one or more frames of little-endian f32 in slab layout. Files are split
//! between the workers in sorted order.
//!
//! ### Geometry Format
//!
//! The detector geometry is a text file of `[panel/]key = value` lines, with `;`
//! starting a comment. Keys without a panel are defaults for every panel declared after
//! them. Each panel needs `min_fs`, `max_fs`, `min_ss`, `max_ss`, `corner_x`,
//! `corner_y`, `res`, one of `clen`/`clen_from` and one of `adu_per_eV`/`adu_per_photon`.
//! Groups whose name starts with `bad` are excluded regions, given either in x/y or in
//! fs/ss (optionally restricted to one panel with `panel`).
//!
//! ## Broadcast Format
//!
//! Subscribers connect to `broadcast.endpoint` and receive frames of
//!
//! ```text
//! u32 BE topic length | topic | u32 BE payload length | JSON payload
//! ```
//!
//! on two topics: `snapshot` (the aggregated statistics, every
//! `data_broadcast_interval` events) and `frame` (a single detector image, whenever a
//! worker ships one). A subscriber may write the line `reset` to clear the accumulated
//! statistics.
pub mod aggregator;
pub mod broadcaster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod message;
pub mod monitor;
pub mod pixel_maps;
pub mod process;
pub mod processor;
pub mod rolling_window;
pub mod source;
pub mod tcp_transport;
pub mod transport;
pub mod worker_status;

use clap::{Arg, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use libxmon::broadcaster::{read_broadcast, FRAME_TOPIC, SNAPSHOT_TOPIC};
use libxmon::config::Config;
use libxmon::error::{BroadcastError, MonitorError};
use libxmon::process::{exit_code, run_local_pool, run_tcp_rank, GeometryContext};
use libxmon::worker_status::MonitorStatus;

fn make_template_config(path: &Path) -> Result<(), MonitorError> {
    Config::default().write_config_file(path)?;
    Ok(())
}

/// Load the geometry and log what it describes
fn check_geometry(config: &Config) -> Result<(), MonitorError> {
    let geometry = GeometryContext::load(&config.geometry_path)?;
    let detector = &geometry.detector;
    log::info!(
        "Geometry {} has {} panel(s), slab shape {:?}",
        config.geometry_path.to_string_lossy(),
        detector.panels().len(),
        detector.slab_shape()
    );
    for panel in detector.panels() {
        log::info!(
            "  {}: fs {}-{} ss {}-{} corner ({}, {}){}",
            panel.name,
            panel.min_fs,
            panel.max_fs,
            panel.min_ss,
            panel.max_ss,
            panel.corner_x,
            panel.corner_y,
            if panel.no_index { " [no_index]" } else { "" }
        );
    }
    log::info!(
        "{} bad region(s), {} bad pixel(s), visualization shape {:?}",
        detector.bad_regions.len(),
        geometry.mask.iter().filter(|bad| **bad).count(),
        geometry.visualization.shape
    );
    Ok(())
}

/// Subscribe to a running collector and log a line per message
fn listen(endpoint: &str) -> Result<(), MonitorError> {
    let mut stream = TcpStream::connect(endpoint).map_err(BroadcastError::from)?;
    log::info!("Subscribed to {endpoint}");
    loop {
        let (topic, payload) = read_broadcast(&mut stream)?;
        match topic.as_str() {
            SNAPSHOT_TOPIC => log::info!(
                "snapshot: {} events, hit rate {:.3}, saturation rate {:.3}",
                payload["num_events"],
                payload["hit_rate"].as_f64().unwrap_or(0.0),
                payload["saturation_rate"].as_f64().unwrap_or(0.0)
            ),
            FRAME_TOPIC => log::info!("frame: {}", payload["event_id"]),
            other => log::warn!("Unknown topic {other}"),
        }
    }
}

/// Turn Ctrl-C into the collector's interrupt flag
fn spawn_interrupt_listener(interrupt: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("Could not start the signal listener: {e}");
                return;
            }
        };
        runtime.block_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::warn!("Interrupt received, shutting the pool down...");
                    interrupt.store(true, Ordering::Relaxed);
                }
                Err(e) => log::error!("Could not listen for Ctrl-C: {e}"),
            }
        });
    });
}

/// Run the pool (or one rank of it) on a separate thread while the spinner follows the
/// collector's status reports
fn run_with_progress(
    pb_manager: &MultiProgress,
    config: Config,
    rank: Option<usize>,
) -> Result<(), MonitorError> {
    let interrupt = Arc::new(AtomicBool::new(false));
    spawn_interrupt_listener(interrupt.clone());

    let (tx, rx) = channel::<MonitorStatus>();
    let handle = std::thread::spawn(move || match rank {
        None => run_local_pool(&config, interrupt, Some(tx)).map(|_| ()),
        Some(rank) => run_tcp_rank(&config, rank, interrupt, Some(tx)).map(|_| ()),
    });

    let pb = pb_manager.add(ProgressBar::new_spinner());
    pb.enable_steady_tick(Duration::from_millis(100));
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(status) => pb.set_message(status.message()),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                if handle.is_finished() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(250));
            }
        }
        if handle.is_finished() {
            break;
        }
    }
    pb.finish();

    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(MonitorError::RankPanicked(rank.unwrap_or(0))),
    }
}

/// The global --path may be given before or after the subcommand
fn config_path(matches: &ArgMatches) -> PathBuf {
    let path = matches
        .subcommand()
        .and_then(|(_, sub)| sub.get_one::<String>("path"))
        .or_else(|| matches.get_one::<String>("path"));
    PathBuf::from(path.map(String::as_str).unwrap_or("config.yml"))
}

fn dispatch(matches: &ArgMatches, pb_manager: &MultiProgress) -> Result<(), MonitorError> {
    if let Some(("listen", sub)) = matches.subcommand() {
        let endpoint = sub
            .get_one::<String>("endpoint")
            .cloned()
            .unwrap_or_else(|| Config::default().broadcast.endpoint);
        return listen(&endpoint);
    }

    let config_path = config_path(matches);

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path)?;
        log::info!("Done.");
        return Ok(());
    }

    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let mut config = Config::read_config_file(&config_path)?;
    log::info!("Config successfully loaded.");
    log::info!("Geometry Path: {}", config.geometry_path.to_string_lossy());
    log::info!("Pool Size: {}", config.coordinator.pool_size);
    log::info!("Broadcast Endpoint: {}", config.broadcast.endpoint);

    match matches.subcommand() {
        Some(("check", _)) => check_geometry(&config),
        Some(("run", _)) => run_with_progress(pb_manager, config, None),
        Some(("rank", sub)) => {
            let rank = sub.get_one::<usize>("rank").copied().unwrap_or(0);
            if let Some(address) = sub.get_one::<String>("collector") {
                config.coordinator.collector_address = address.clone();
            }
            log::info!(
                "Running rank {rank} with collector at {}",
                config.coordinator.collector_address
            );
            run_with_progress(pb_manager, config, Some(rank))
        }
        _ => Ok(()),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("xmon_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(Command::new("check").about("Load the geometry and print a summary"))
        .subcommand(Command::new("run").about("Run the whole pool as threads of this process"))
        .subcommand(
            Command::new("rank")
                .about("Run one rank of a multi-process pool")
                .arg(
                    Arg::new("rank")
                        .short('r')
                        .long("rank")
                        .required(true)
                        .value_parser(clap::value_parser!(usize))
                        .help("Rank to run; 0 is the collector"),
                )
                .arg(
                    Arg::new("collector")
                        .short('c')
                        .long("collector")
                        .help("Collector address, overriding the config"),
                ),
        )
        .subcommand(
            Command::new("listen")
                .about("Subscribe to a running collector and log what it publishes")
                .arg(
                    Arg::new("endpoint")
                        .short('e')
                        .long("endpoint")
                        .help("Broadcast endpoint to connect to"),
                ),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the config file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        std::process::exit(1);
    }
    log::set_max_level(simplelog::LevelFilter::Info);

    let result = dispatch(&matches, &pb_manager);
    match &result {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("{e}"),
    }
    std::process::exit(exit_code(&result));
}

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bustun_bridge::Bridge;
use bustun_common::{dev_error, dev_info, dev_warn};
use bustun_line::{LoopbackBus, SerialLine};
use bustun_link::engine::EngineCmd;
use bustun_link::tx::LineTx;
use bustun_link::{RxItem, build_link};
use clap::Parser;
use log::LevelFilter;
use nix::sys::signal::{SigHandler, Signal, signal};

use config::BridgeConfig;

#[derive(Parser, Debug)]
#[command(name = "bustund", about = "Bridges a half-duplex serial bus onto a UDP tunnel")]
struct Args {
    /// Path to the JSON peer configuration.
    #[arg(long)]
    config: PathBuf,

    /// Serial device of the clocked line transceiver. Without it the
    /// bridge runs against an in-process loopback bus for bench use.
    #[arg(long)]
    serial: Option<String>,

    /// Baud rate towards the line transceiver.
    #[arg(long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Seconds between statistics log lines; 0 disables them.
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            dev_error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    unsafe {
        // SAFETY: the handler only stores to an atomic.
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_sigint));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_sigint));
    }

    match &args.serial {
        Some(path) => run_serial(path, args.baud_rate, &cfg, args.stats_interval),
        None => run_loopback(&cfg, args.stats_interval),
    }
}

fn run_serial(path: &str, baud_rate: u32, cfg: &BridgeConfig, stats_interval: u64) -> ExitCode {
    let line = match SerialLine::open(path, baud_rate) {
        Ok(line) => line,
        Err(e) => {
            dev_error!("Could not open {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let link = build_link(Arc::clone(&line));
    line.attach(Arc::clone(&link.shared));

    let (mut bridge, pump) = match Bridge::new(link) {
        Ok(parts) => parts,
        Err(e) => {
            dev_error!("Could not set up bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let rx_stop = Arc::new(AtomicBool::new(false));
    let rx_thread = line.spawn_rx(pump, Arc::clone(&rx_stop));

    if let Err(e) = bridge.start(|table| config::apply(cfg, table)) {
        dev_warn!("Configuration incomplete: {}", e);
    }

    supervise(&bridge, stats_interval);

    bridge.shutdown();
    rx_stop.store(true, Ordering::Relaxed);
    let _ = rx_thread.join();
    ExitCode::SUCCESS
}

/// Bench mode: the far side of the bus is a second in-process link that
/// acknowledges the handshake and logs whatever it receives.
fn run_loopback(cfg: &BridgeConfig, stats_interval: u64) -> ExitCode {
    let (port_a, port_b) = LoopbackBus::new_pair();
    let link_a = build_link(Arc::clone(&port_a));
    let link_b = build_link(Arc::clone(&port_b));
    port_a.attach(Arc::clone(&link_a.shared));
    port_b.attach(Arc::clone(&link_b.shared));

    // The loopback station answers for the configured bus stations.
    for peer in &cfg.bus_peers {
        link_b.filter.enable_station(peer.station_id);
    }

    let station_rx = Arc::clone(&link_b.rx_queue);
    let station_sender = link_b.rx_sender.clone();
    let station_cmds = link_b.engine_cmds.clone();
    let station_engine = thread::Builder::new()
        .name("station-engine".into())
        .spawn(move || link_b.engine.run())
        .expect("spawn station engine");
    let station_log = thread::Builder::new()
        .name("station-log".into())
        .spawn(move || {
            let queue = station_rx.lock().unwrap();
            loop {
                match queue.recv() {
                    Ok(RxItem::Frame(pkt)) => {
                        dev_info!("Loopback station received a {} byte frame", pkt.len());
                    }
                    Ok(RxItem::Idle) => {}
                    Ok(RxItem::Shutdown) | Err(_) => return,
                }
            }
        })
        .expect("spawn station log");

    let (mut bridge, pump_a) = match Bridge::new(link_a) {
        Ok(parts) => parts,
        Err(e) => {
            dev_error!("Could not set up bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let bus = LoopbackBus::spawn(port_a, port_b, pump_a, link_b.pump);

    if let Err(e) = bridge.start(|table| config::apply(cfg, table)) {
        dev_warn!("Configuration incomplete: {}", e);
    }

    supervise(&bridge, stats_interval);

    bridge.shutdown();
    let _ = station_cmds.send(EngineCmd::Shutdown);
    let _ = station_sender.send(RxItem::Shutdown);
    let _ = station_engine.join();
    let _ = station_log.join();
    drop(bus);
    ExitCode::SUCCESS
}

fn supervise<L: LineTx + 'static>(bridge: &Bridge<L>, stats_interval: u64) {
    dev_info!("Bridge running");
    let interval = Duration::from_secs(stats_interval);
    let mut next_stats = Instant::now() + interval;

    while !SHUTDOWN.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(300));
        if stats_interval != 0 && Instant::now() >= next_stats {
            next_stats = Instant::now() + interval;
            log_stats(bridge);
        }
    }
    dev_info!("Shutting down");
}

fn log_stats<L: LineTx + 'static>(bridge: &Bridge<L>) {
    match (
        serde_json::to_string(&bridge.link_stats()),
        serde_json::to_string(&bridge.bridge_stats()),
    ) {
        (Ok(link), Ok(tunnel)) => {
            dev_info!("link stats: {}", link);
            dev_info!("bridge stats: {}", tunnel);
        }
        _ => dev_warn!("Could not serialise statistics"),
    }
}

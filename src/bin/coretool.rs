//! Demonstration binary wiring every core module together: registry, keyspace,
//! ancillary storage, watch bus, the numnick/IPcheck identity space, and the event
//! engine driving it all. Mirrors the donor crate's thin `clap`-fronted node binary,
//! scaled down to just exercise the core substrate rather than run a full daemon.

use clap::Parser;
use ircd_core::engine::{Engine, EventKind, TimerKind};
use ircd_core::ipcheck::IpCheck;
use ircd_core::numnick::ServerTable;
use ircd_core::registry::{RegisteredEntry, Registry};
use ircd_core::watch::{Watch, WatchRegistry, EV_CREATE};
use ircd_core::Config;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "coretool", about = "Exercise the ircd-core substrate standalone")]
struct CoreArgs {
    /// Max recent connection attempts per address before IPcheck throttles it.
    #[arg(long, default_value_t = Config::default().ipcheck_clone_limit)]
    ipcheck_clone_limit: u32,

    /// Upper bound on simultaneously registered sockets.
    #[arg(long, default_value_t = Config::default().max_sockets)]
    max_sockets: usize,

    /// Consecutive backend errors before the engine requests a restart.
    #[arg(long, default_value_t = Config::default().backend_error_threshold)]
    backend_error_threshold: u32,

    /// How often, in seconds, to log a status line.
    #[arg(long, default_value_t = 5)]
    status_interval: u64,

    /// tracing-subscriber filter directive, e.g. "debug" or "ircd_core=trace".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug)]
struct ServerName(String);

impl RegisteredEntry for ServerName {
    fn name(&self) -> &str {
        &self.0
    }
    fn magic(&self) -> u64 {
        SERVER_MAGIC
    }
}

const SERVER_MAGIC: u64 = 0x5356_5221;

fn main() {
    let args = CoreArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(args.log_level.clone()))
        .init();

    let config = Config {
        ipcheck_clone_limit: args.ipcheck_clone_limit,
        max_sockets: args.max_sockets,
        backend_error_threshold: args.backend_error_threshold,
        ..Config::default()
    };

    if let Err(err) = run(config, args.status_interval) {
        warn!(%err, "coretool exiting on error");
        std::process::exit(1);
    }
}

fn run(config: Config, status_interval: u64) -> ircd_core::CoreResult<()> {
    let mut registry = Registry::new();
    registry.create_table("servers", SERVER_MAGIC);
    registry.register("servers", Arc::new(ServerName("hub.example.net".to_string())))?;

    let watches = WatchRegistry::new();
    watches.add(
        "servers",
        Arc::new(Watch::new(
            0,
            ircd_core::watch::event_bit(EV_CREATE),
            Arc::new(|_ev, _obj, _extra| {
                info!("watch: a server entry was created");
                false
            }),
        )),
    );

    let mut servers: ServerTable<String> = ServerTable::new();
    servers.set_server_yxx(0, "hub.example.net".to_string());

    let ipcheck = Rc::new(IpCheck::new(&config, Arc::new(ircd_core::time::SystemClock)));

    let engine = Engine::init(config)?;

    // Probe one connection through IPcheck so the status line has something to show.
    if let Err(e) = ipcheck.check_local(IpAddr::V4(Ipv4Addr::LOCALHOST)) {
        warn!(%e, "loopback probe rejected by ipcheck (unexpected outside a hostile test)");
    }

    engine.signal_add(SIGINT, Rc::new(move |e, ev| {
        if ev.kind == EventKind::Signal {
            info!("received SIGINT, shutting down");
            e.stop();
        }
    }))?;
    engine.signal_add(SIGTERM, Rc::new(move |e, ev| {
        if ev.kind == EventKind::Signal {
            info!("received SIGTERM, shutting down");
            e.stop();
        }
    }))?;

    let registry = Rc::new(RefCell::new(registry));
    let ipcheck_for_timer = ipcheck.clone();
    let registry_for_timer = registry.clone();
    engine.timer_add(
        TimerKind::Periodic,
        status_interval,
        Rc::new(move |_e, ev| {
            if ev.kind == EventKind::Expire {
                let servers = registry_for_timer.borrow().len("servers").unwrap_or(0);
                let loopback_conns = ipcheck_for_timer.count(IpAddr::V4(Ipv4Addr::LOCALHOST));
                info!(servers, loopback_conns, "status");
                ipcheck_for_timer.expire_sweep();
            }
        }),
    );

    info!(backend = engine.engine_name(), "engine starting");
    engine.run()?;
    info!("engine stopped cleanly");
    Ok(())
}

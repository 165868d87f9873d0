//
// Dataplane agent: answers pings and redirects VXLAN traffic on one interface queue, following
// neighbor state streamed from the control plane.
//
// The queue is passed on the command line. The easiest way to steer all traffic arriving at a
// link to that queue is with ethtool -X.
//
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use structopt::StructOpt;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vxwing::config::{Config, ConfigError, SyncConfig, XdpMode};
use vxwing::engine::{raise_memlock_limit, Session, SessionError, Shutdown};
use vxwing::maps::{BpfMaps, MirrorError};
use vxwing::program::{ProgramError, XdpProgram};
use vxwing::socket::{detach_program, SocketError};
use vxwing::store::PolicyStore;
use vxwing::sync::{LineTransport, StreamCloser, SyncClient, SyncError, SyncStats, WatchRequest};

#[derive(StructOpt, Debug)]
#[structopt(name = "vxwing", about = "AF_XDP dataplane agent for VXLAN overlay nodes")]
struct Opt {
    /// Operate on device <ifname>
    #[structopt(short = "d", long = "dev")]
    dev: Option<String>,

    /// Install XDP program in SKB (AKA generic) mode
    #[structopt(short = "S", long, conflicts_with_all = &["native-mode", "auto-mode"])]
    skb_mode: bool,

    /// Install XDP program in native mode
    #[structopt(short = "N", long, conflicts_with = "auto-mode")]
    native_mode: bool,

    /// Auto-detect SKB or native mode
    #[structopt(short = "A", long)]
    auto_mode: bool,

    /// Force install, replacing existing program on interface
    #[structopt(short = "F", long)]
    force: bool,

    /// Force copy mode
    #[structopt(short = "c", long, conflicts_with = "zero-copy")]
    copy: bool,

    /// Force zero-copy mode
    #[structopt(short = "z", long)]
    zero_copy: bool,

    /// Configure interface receive queue for AF_XDP
    #[structopt(short = "Q", long)]
    queue: Option<usize>,

    /// Use the poll() API waiting for packets to arrive
    #[structopt(short = "p", long)]
    poll_mode: bool,

    /// Unload XDP program instead of loading
    #[structopt(short = "U", long)]
    unload: bool,

    /// Quiet mode (no output)
    #[structopt(short = "q", long)]
    quiet: bool,

    /// Load program from <file>
    #[structopt(long, parse(from_os_str))]
    filename: Option<PathBuf>,

    /// Load program in <section> of the ELF file
    #[structopt(long)]
    progsec: Option<String>,

    /// YAML configuration, command line flags override it
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(long)]
    batch_size: Option<usize>,

    /// Control plane address. Without it the store stays empty.
    #[structopt(long)]
    master_ip: Option<IpAddr>,

    #[structopt(long)]
    master_port: Option<u16>,

    #[structopt(long)]
    group: Option<String>,

    #[structopt(long)]
    neighbor_table: Option<String>,

    #[structopt(long)]
    security_group_rules_table: Option<String>,

    /// Pinned neighbor map to mirror updates into
    #[structopt(long, parse(from_os_str))]
    neighbor_map: Option<PathBuf>,

    /// Pinned security group rule map to mirror updates into
    #[structopt(long, parse(from_os_str))]
    security_group_map: Option<PathBuf>,
}

impl Opt {
    fn into_config(self) -> Result<Config, ConfigError> {
        let mut c = match &self.config {
            Some(path) => Config::from_yaml_file(path)?,
            None => Config::default(),
        };

        if let Some(dev) = self.dev {
            c.ifname = dev;
        }
        if self.skb_mode {
            c.xdp_mode = XdpMode::Generic;
        }
        if self.native_mode {
            c.xdp_mode = XdpMode::Native;
        }
        if self.auto_mode {
            c.xdp_mode = XdpMode::Auto;
        }
        c.force |= self.force;
        c.copy_mode |= self.copy;
        c.zero_copy |= self.zero_copy;
        c.poll_mode |= self.poll_mode;
        c.unload |= self.unload;
        if let Some(q) = self.queue {
            c.queue = q;
        }
        if let Some(n) = self.batch_size {
            c.batch_size = n;
        }
        if self.filename.is_some() {
            c.filename = self.filename;
        }
        if let Some(s) = self.progsec {
            c.progsec = s;
        }
        if self.neighbor_map.is_some() {
            c.neighbor_map = self.neighbor_map;
        }
        if self.security_group_map.is_some() {
            c.security_group_map = self.security_group_map;
        }

        let wants_sync = self.master_ip.is_some()
            || self.master_port.is_some()
            || self.group.is_some()
            || self.neighbor_table.is_some()
            || self.security_group_rules_table.is_some();
        if wants_sync {
            let sync = c.sync.get_or_insert_with(SyncConfig::default);
            if let Some(ip) = self.master_ip {
                sync.server_ip = ip;
            }
            if let Some(port) = self.master_port {
                sync.server_port = port;
            }
            if let Some(g) = self.group {
                sync.group = g;
            }
            if let Some(t) = self.neighbor_table {
                sync.neighbor_table = t;
            }
            if let Some(t) = self.security_group_rules_table {
                sync.security_group_rules_table = t;
            }
        }

        Ok(c)
    }
}

#[derive(Debug, Error)]
enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("installing the signal handler failed: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("spawning the sync thread failed: {0}")]
    Spawn(#[source] std::io::Error),
}

struct SyncThread {
    closer: StreamCloser,
    handle: JoinHandle<Result<SyncStats, SyncError>>,
}

impl SyncThread {
    fn spawn(config: &Config, sync: &SyncConfig, store: Arc<PolicyStore>) -> Result<Self, AgentError> {
        let mirror = BpfMaps::open(
            config.neighbor_map.as_deref(),
            config.security_group_map.as_deref(),
        )?;
        if mirror.is_empty() {
            info!("no kernel maps configured, updates stay in userspace");
        }

        let transport = LineTransport::connect(SocketAddr::new(sync.server_ip, sync.server_port))?;
        let closer = transport.closer().map_err(SyncError::from)?;
        let request = WatchRequest::from_config(sync);

        let handle = thread::Builder::new()
            .name("sync".into())
            .spawn(move || SyncClient::new(transport, store, mirror, request).run())
            .map_err(AgentError::Spawn)?;

        Ok(SyncThread { closer, handle })
    }

    fn stop(self) {
        self.closer.close();
        match self.handle.join() {
            Ok(Ok(stats)) => info!(
                accepted = stats.accepted,
                stale = stats.stale,
                mirror_failures = stats.mirror_failures,
                "sync stopped"
            ),
            Ok(Err(e)) => warn!(error = %e, "sync ended with an error"),
            Err(_) => warn!("sync thread panicked"),
        }
    }
}

fn run(opt: Opt) -> Result<(), AgentError> {
    let config = opt.into_config()?;
    config.validate()?;

    if config.unload {
        detach_program(&config.ifname, config.xdp_flags())?;
        info!(ifname = %config.ifname, "XDP program detached");
        return Ok(());
    }

    raise_memlock_limit()?;

    let shutdown = Shutdown::new();
    let s = shutdown.clone();
    ctrlc::set_handler(move || s.trigger())?;

    // Dropping the program detaches it, so an early return below leaves the interface clean.
    let program = match &config.filename {
        Some(path) => Some(XdpProgram::load_and_attach(
            &config.ifname,
            path,
            &config.progsec,
            config.xdp_flags(),
        )?),
        None => None,
    };

    let store = Arc::new(PolicyStore::new());

    let sync = match &config.sync {
        Some(sync) => Some(SyncThread::spawn(&config, sync, store.clone())?),
        None => {
            info!("no control plane configured");
            None
        }
    };

    let result = Session::open(&config, store, program.as_ref()).and_then(|mut session| {
        let r = session.run(&shutdown);
        let stats = session.close();
        info!(
            rx_packets = stats.rx_packets,
            tx_packets = stats.tx_packets,
            dropped = stats.dropped,
            "dataplane stopped"
        );
        r
    });

    if let Some(sync) = sync {
        sync.stop();
    }

    if let Some(mut program) = program {
        if let Err(e) = program.detach() {
            warn!(error = %e, "leaving XDP program attached");
        }
    }

    Ok(result?)
}

fn main() {
    let opt = Opt::from_args();

    let default_level = if opt.quiet { "warn" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(opt) {
        error!(error = %e, "fatal");
        process::exit(1);
    }
}

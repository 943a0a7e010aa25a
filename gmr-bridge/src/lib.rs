//! # GMR Bridge
//!
//! Bridges a Garmin GMR18 radome onto a publish/subscribe message bus.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        gmr-bridge                            │
//! │                                                              │
//! │  multicast ──► IngestLoop ──► sweep / status topics          │
//! │  239.254.2.0:50100  (SweepAssembler from gmr-core)           │
//! │                                                              │
//! │  command topic ──► CommandLoop ──► control frames            │
//! │                    (translate from gmr-core)  radar:50101    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each loop runs as a [`tokio_graceful_shutdown`] subsystem and owns its
//! socket. The loops share only the [`bus::MessageBus`].
//!
//! ## Example: Running the bridge on an in-process bus
//!
//! ```rust,no_run
//! use clap::Parser;
//! use gmr_bridge::bridge::{command::CommandLoop, ingest::IngestLoop};
//! use gmr_bridge::bus::{LocalBus, MessageBus};
//! use gmr_bridge::{network, Cli};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["gmr-bridge", "--interface", "eth0"]);
//!     let nic = network::resolve_interface("eth0").unwrap();
//!     let config = args.bridge_config();
//!     let bus = LocalBus::default();
//!
//!     let data = network::create_udp_multicast_listen(&args.data_address(), &nic, 0).unwrap();
//!     let control = network::create_control_socket(&args.control_address(), &nic).unwrap();
//!
//!     let ingest = IngestLoop::new("GMR18", data, Arc::new(bus.clone()), config.clone());
//!     let command = CommandLoop::new("GMR18", control, bus.subscribe(&config.topics.command));
//!
//!     Toplevel::new(|s| async move {
//!         s.start(SubsystemBuilder::new("Ingest", |subsys| ingest.run(subsys)));
//!         s.start(SubsystemBuilder::new("Commands", |subsys| command.run(subsys)));
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `-i, --interface` - Network interface (name or IPv4 address) facing the radome
//! - `-f, --format` - Sweep payload format, `json` or `binary`
//! - `--output` - Print everything published to stdout
//! - `--stdin-commands` - Read commands from stdin
//! - `-v` - Increase verbosity (use multiple times)

use std::net::{Ipv4Addr, SocketAddrV4};

use clap::Parser;
use gmr_core::protocol::gmr18;
use gmr_core::sweep::{
    AssemblerConfig, DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_REMEMBERED, DEFAULT_STALENESS_MS,
};

pub mod bridge;
pub mod bus;
pub mod network;

use bridge::{
    BridgeConfig, Topics, DEFAULT_COMMAND_TOPIC, DEFAULT_STATUS_TOPIC, DEFAULT_SWEEP_TOPIC,
};
use bus::payload::SweepFormat;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default multicast receive buffer, 1 MiB
pub const DEFAULT_RECV_BUFFER: usize = 1024 * 1024;

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Interface facing the radome, by name or IPv4 address.
    /// When absent the interface on the radome's subnet is used, if any.
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Multicast group the radome sends data to
    #[arg(long, default_value_t = gmr18::MULTICAST_ADDR)]
    pub multicast_address: Ipv4Addr,

    /// Port of the multicast data group
    #[arg(long, default_value_t = gmr18::DATA_PORT)]
    pub data_port: u16,

    /// Address of the radome
    #[arg(short, long, default_value_t = gmr18::RADAR_ADDR)]
    pub radar_address: Ipv4Addr,

    /// Control port on the radome
    #[arg(long, default_value_t = gmr18::SEND_PORT)]
    pub control_port: u16,

    /// Topic completed sweeps are published on
    #[arg(long, default_value = DEFAULT_SWEEP_TOPIC)]
    pub sweep_topic: String,

    /// Topic status and settings reports are published on
    #[arg(long, default_value = DEFAULT_STATUS_TOPIC)]
    pub status_topic: String,

    /// Topic command messages are read from
    #[arg(long, default_value = DEFAULT_COMMAND_TOPIC)]
    pub command_topic: String,

    /// Encoding of published sweeps
    #[arg(short, long, default_value_t, value_enum)]
    pub format: SweepFormat,

    /// Partial sweeps older than this many milliseconds are dropped
    #[arg(long, default_value_t = DEFAULT_STALENESS_MS)]
    pub staleness_ms: u64,

    /// Maximum number of partial sweeps kept at once
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT)]
    pub max_in_flight: usize,

    /// Maximum number of emitted sweeps remembered to drop late fragments
    #[arg(long, default_value_t = DEFAULT_MAX_REMEMBERED)]
    pub max_remembered: usize,

    /// Receive buffer size for the multicast socket in bytes, 0 for the OS default
    #[arg(long, default_value_t = DEFAULT_RECV_BUFFER)]
    pub recv_buffer: usize,

    /// Write everything published to stdout
    #[arg(long, default_value_t = false)]
    pub output: bool,

    /// Read commands from stdin, one per line.
    /// A line is either a JSON command message or one of the single key
    /// shortcuts: a/q power on/off, w/e/r/t range 0.25/0.5/1/3 nm,
    /// s auto gain, d/f/g/h/j gain 0/25/50/75/100, c/C FTC off/on,
    /// x/X crosstalk off/on.
    #[arg(long, default_value_t = false)]
    pub stdin_commands: bool,
}

impl Cli {
    pub fn data_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.multicast_address, self.data_port)
    }

    pub fn control_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.radar_address, self.control_port)
    }

    pub fn topics(&self) -> Topics {
        Topics {
            sweep: self.sweep_topic.clone(),
            status: self.status_topic.clone(),
            command: self.command_topic.clone(),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            topics: self.topics(),
            format: self.format,
            assembler: AssemblerConfig {
                staleness_ms: self.staleness_ms,
                max_in_flight: self.max_in_flight,
                max_remembered: self.max_remembered,
            },
        }
    }
}

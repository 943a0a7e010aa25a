use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gmr_bridge::bridge::command::CommandLoop;
use gmr_bridge::bridge::ingest::IngestLoop;
use gmr_bridge::bridge::stdio;
use gmr_bridge::bus::payload::SweepFormat;
use gmr_bridge::bus::{LocalBus, MessageBus};
use gmr_bridge::{network, Cli, VERSION};
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    log::info!("gmr-bridge {} starting", VERSION);

    let nic = match &args.interface {
        Some(interface) => network::resolve_interface(interface)
            .into_diagnostic()
            .wrap_err_with(|| format!("Cannot use interface '{}'", interface))?,
        None => network::find_nic_for_radar(&args.radar_address).unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    log::info!("Using interface {}", nic);

    let data_addr = args.data_address();
    let data_sock = network::create_udp_multicast_listen(&data_addr, &nic, args.recv_buffer)
        .map_err(|e| {
            log::error!("Cannot join multicast group {} on {}: {}", data_addr, nic, e);
            e
        })
        .into_diagnostic()
        .wrap_err_with(|| format!("Cannot listen on {}", data_addr))?;

    let control_addr = args.control_address();
    let control_sock = network::create_control_socket(&control_addr, &nic)
        .map_err(|e| {
            log::error!("Cannot open control socket to {}: {}", control_addr, e);
            e
        })
        .into_diagnostic()
        .wrap_err_with(|| format!("Cannot reach radar at {}", control_addr))?;

    let config = args.bridge_config();
    let key = format!("GMR18 {}", args.radar_address);
    let bus = LocalBus::default();

    // Subscribe before the loops start so nothing published early is missed
    let commands = bus.subscribe(&config.topics.command);
    let output = args.output.then(|| {
        (
            bus.subscribe(&config.topics.sweep),
            bus.subscribe(&config.topics.status),
        )
    });

    let ingest = IngestLoop::new(&key, data_sock, Arc::new(bus.clone()), config.clone());
    let command = CommandLoop::new(&key, control_sock, commands);

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("Ingest", |subsys| ingest.run(subsys)));
        s.start(SubsystemBuilder::new("Commands", |subsys| command.run(subsys)));

        if let Some((sweep_output, status_output)) = output {
            let binary = config.format == SweepFormat::Binary;
            s.start(SubsystemBuilder::new("SweepOutput", move |subsys| {
                stdio::forward_output(subsys, sweep_output, !binary)
            }));
            s.start(SubsystemBuilder::new("StatusOutput", |subsys| {
                stdio::forward_output(subsys, status_output, true)
            }));
        }

        if args.stdin_commands {
            let bus: Arc<dyn MessageBus> = Arc::new(bus);
            let topic = config.topics.command.clone();
            s.start(SubsystemBuilder::new("StdinCommands", |subsys| {
                stdio::forward_stdin_commands(subsys, bus, topic)
            }));
        }
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(Into::into)
}

use clap::Parser;
use pxeboot::{
    network::{interface_mac_address, UdpBootTransport, UdpChannel, UdpDhcpTransport},
    v4::ExchangeTiming,
    Args, ClientConfig, PxeBootClient,
};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn run(args: &Args) -> Result<pxeboot::BootSession, pxeboot::PxeError> {
    let mac_addr = interface_mac_address(&args.interface)?;
    tracing::info!("Found MAC address {:02x?} on '{}'", &mac_addr[..], args.interface);

    let config = ClientConfig::from_args(args, mac_addr)?;
    tracing::info!(
        "Attempting to bind to interface '{}' and port {}...",
        config.interface,
        config.client_port
    );
    let channel = UdpChannel::bind(&config.interface, config.client_port)?;

    let dhcp = UdpDhcpTransport::new(channel.clone(), ExchangeTiming::from_config(&config));
    let boot = UdpBootTransport::new(channel, &config);
    let mut client = PxeBootClient::new(config, dhcp, boot);
    client.run()
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(session) => {
            println!("address     {}", session.station.client_address);
            if let Some(mask) = session.station.subnet_mask {
                println!("netmask     {mask}");
            }
            if let Some(router) = session.station.router {
                println!("router      {router}");
            }
            println!("boot server {}", session.target.server_address);
            println!("boot file   {}", session.target.boot_file_name);
            if let Some(size) = session.target.boot_file_size_hint {
                println!("file size   {size}");
            }
            println!("block size  {}", session.target.block_size_hint);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("PXE boot failed: {} ({:?})", e, e.status());
            ExitCode::FAILURE
        }
    }
}

//! dnsmole - DNS tunnelling client.
//!
//! Thin front end: parses the command line, picks exactly one input
//! driver and the DNS output driver, resolves the upstream DNS server,
//! and hands everything to the reactor core.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use dnsmole::bus::{Bus, Event};
use dnsmole::dns::{Name, RecordType};
use dnsmole::drivers::{DnsDriver, InputDriver};
use dnsmole::{resolver, ClientConfig, Core, Error};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "dnsmole")]
#[command(version = VERSION)]
#[command(about = "DNS tunnelling client", long_about = None)]
struct Cli {
    /// Tunnel domain (alternative to --dns)
    domain: Option<String>,

    /// Tunnel domain
    #[arg(long, value_name = "DOMAIN")]
    dns: Option<String>,

    /// Name for this connection in the server's session list
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Request the given file from the server
    #[arg(long, value_name = "FILENAME")]
    download: Option<String>,

    /// Start at the given chunk of the --download file
    #[arg(long, value_name = "N")]
    chunk: Option<u32>,

    /// Attempt to ping the tunnel server
    #[arg(long)]
    ping: bool,

    /// Send/receive on the console [default]
    #[arg(long, visible_alias = "stdin")]
    console: bool,

    /// Use the framed "command" protocol on the stream
    #[arg(long)]
    command: bool,

    /// Execute the given process and link it to the stream
    #[arg(short = 'e', long, value_name = "PROCESS")]
    exec: Option<String>,

    /// Listen on the given TCP port and link the first connection to the stream
    #[arg(short = 'l', long, value_name = "PORT")]
    listen: Option<u16>,

    /// The DNS server [default: system resolver]
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// The DNS port
    #[arg(long, default_value_t = 53)]
    port: u16,

    /// Carrier record types, used round-robin
    #[arg(
        long = "type",
        value_name = "TYPE",
        value_delimiter = ',',
        default_value = "TXT",
        value_parser = parse_record_type
    )]
    record_types: Vec<RecordType>,

    /// Display more debug info (can be used multiple times)
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Display less debug info (can be used multiple times)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    quiet: u8,
}

fn parse_record_type(s: &str) -> Result<RecordType, String> {
    s.parse()
}

/// `-d`/`-q` counters shift the filter up and down from `Warn`.
fn log_level(debug: u8, quiet: u8) -> log::LevelFilter {
    const LEVELS: [log::LevelFilter; 6] = [
        log::LevelFilter::Off,
        log::LevelFilter::Error,
        log::LevelFilter::Warn,
        log::LevelFilter::Info,
        log::LevelFilter::Debug,
        log::LevelFilter::Trace,
    ];
    let base = 2i16; // Warn
    let index = (base + debug as i16 - quiet as i16).clamp(0, 5) as usize;
    LEVELS[index]
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(log_level(cli.debug, cli.quiet))
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    info!("dnsmole {} ({} {})", VERSION, GIT_HASH, BUILD_DATE);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Config(message)) => {
            eprintln!("dnsmole: {}", message);
            ExitCode::from(1)
        }
        Err(Error::NoResolver) => {
            eprintln!("dnsmole: {}", Error::NoResolver);
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("dnsmole: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let driver = select_input_driver(&cli)?;

    let domain = match cli.dns.as_deref().or(cli.domain.as_deref()) {
        Some(domain) => {
            Name::parse(domain).map_err(|e| Error::Config(format!("bad domain {}: {}", domain, e)))?
        }
        None if driver == InputDriver::Ping => Name::root(),
        None => {
            return Err(Error::Config(
                "please provide a domain (either with --dns or at the end of the command line)"
                    .to_string(),
            ))
        }
    };

    let server = resolve_server(cli.host.as_deref(), cli.port).await?;

    let mut config = ClientConfig::new(domain.clone(), server);
    config.record_types = cli.record_types.clone();
    config.name = cli.name.clone();
    config.download = cli.download.clone();
    config.chunk = cli.chunk;
    config.command = driver.wants_command_framing();
    config.validate()?;

    info!("INPUT: {}", driver);
    info!("OUTPUT: DNS tunnel to {} via {}", domain, server);

    let bus = Bus::new();
    let dns = DnsDriver::connect(server, domain, config.record_types.clone()).await?;
    let mut core = Core::new(bus.clone(), dns, config.clone(), driver == InputDriver::Ping);
    let handle = driver.spawn(&bus).await?;

    // Session options arrive over the bus before the kick-off.
    if let Some(name) = config.name.clone() {
        bus.publish(Event::ConfigString {
            key: "name".to_string(),
            value: name,
        });
    }
    if let Some(download) = config.download.clone() {
        bus.publish(Event::ConfigString {
            key: "download".to_string(),
            value: download,
        });
    }
    if let Some(chunk) = config.chunk {
        bus.publish(Event::ConfigInt {
            key: "chunk".to_string(),
            value: chunk,
        });
    }
    bus.publish(Event::Start);

    let result = core.run().await;

    // Teardown order: session engine is already drained, then the input
    // driver, then the bus subscribers notice Shutdown and stop.
    warn!("terminating");
    bus.publish(Event::Shutdown);
    handle.destroy();

    result
}

fn select_input_driver(cli: &Cli) -> Result<InputDriver, Error> {
    let mut drivers = Vec::new();
    if cli.console {
        drivers.push(InputDriver::Console);
    }
    if cli.command {
        drivers.push(InputDriver::Command);
    }
    if let Some(program) = &cli.exec {
        drivers.push(InputDriver::Exec {
            program: program.clone(),
        });
    }
    if let Some(port) = cli.listen {
        drivers.push(InputDriver::Listener { port });
    }
    if cli.ping {
        drivers.push(InputDriver::Ping);
    }

    match drivers.len() {
        0 => Ok(InputDriver::Console),
        1 => Ok(drivers.remove(0)),
        _ => Err(Error::Config(
            "more than one of --console, --command, --exec, --listen, and --ping can't be set"
                .to_string(),
        )),
    }
}

async fn resolve_server(host: Option<&str>, port: u16) -> Result<SocketAddr, Error> {
    match host {
        Some(host) => {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return Ok(SocketAddr::new(ip, port));
            }
            // A hostname for the resolver itself is looked up through the
            // OS, not through the tunnel.
            tokio::net::lookup_host((host, port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| Error::Config(format!("cannot resolve DNS server {}", host)))
        }
        None => resolver::system_resolver()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or(Error::NoResolver),
    }
}

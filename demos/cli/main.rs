use pinger::{ChannelListener, PingConfig, PingEvent, Pinger, SocketType};
use std::collections::HashSet;
use std::time::Duration;

type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(argh::FromArgs)]
/// ping - send ICMP ECHO_REQUEST to network hosts
struct Args {
    #[argh(option, short = 'c', default = "10")]
    /// stop a host after <count> sequences
    count: u16,

    #[argh(option, short = 'i', default = "1000")]
    /// milliseconds between requests
    interval: u64,

    #[argh(option, short = 'W', default = "1000")]
    /// milliseconds to wait for each reply
    timeout: u64,

    #[argh(option, short = 't', default = "pinger::DEFAULT_TTL")]
    /// time to live
    ttl: u8,

    #[argh(option, short = 's', default = "pinger::DEFAULT_PAYLOAD_SIZE")]
    /// payload bytes
    size: usize,

    #[argh(switch)]
    /// use raw sockets (needs root)
    raw: bool,

    #[argh(switch, short = 'v')]
    /// log engine internals
    verbose: bool,

    #[argh(positional)]
    /// host names or IP addresses
    hosts: Vec<String>,
}

fn main() -> Result<(), GenericError> {
    let args: Args = argh::from_env();

    let level = if args.verbose { tracing::Level::TRACE } else { tracing::Level::WARN };
    let subscriber = tracing_subscriber::FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let socket_type = if args.raw { SocketType::Raw } else { SocketType::Dgram };
    let (listener, events) = ChannelListener::new();
    let pinger = Pinger::with_socket_type(listener, socket_type)?;
    let config = PingConfig {
        interval: Duration::from_millis(args.interval),
        timeout: Duration::from_millis(args.timeout),
        ttl: args.ttl,
        payload_size: args.size,
        ..PingConfig::default()
    };

    let mut running = HashSet::new();
    let mut started = HashSet::new();
    for host in &args.hosts {
        running.insert(pinger.start(host, config.clone())?);
    }

    while !running.is_empty() {
        let event = events.recv()?;
        match &event {
            PingEvent::Start(info) => println!("PING {info}: {} data bytes", info.payload_size),
            PingEvent::ReplyReceived { info, sequence, elapsed } => {
                println!(
                    "{} bytes from {info}: icmp_seq={sequence} ttl={} time={elapsed:?}",
                    info.payload_size, info.ttl
                );
            }
            PingEvent::Timeout { info, sequence } => println!("{info}: icmp_seq={sequence} timed out"),
            PingEvent::SendError { info, sequence } => println!("{info}: icmp_seq={sequence} could not be sent"),
            PingEvent::Exception { info, error, is_fatal } => {
                println!("{info}: {error}{}", if *is_fatal { " (fatal)" } else { "" });
            }
            PingEvent::Stop(info) => println!("--- {info} stopped ---"),
        }

        if let Some(sequence) = event.sequence() {
            if sequence >= args.count {
                event.info().stop();
            }
        }
        match event {
            PingEvent::Start(info) => {
                started.insert(info.ping_id);
            }
            PingEvent::Stop(info) => {
                running.remove(&info.ping_id);
            }
            // a session that fails before it starts ends without a stop
            PingEvent::Exception { info, .. } if !started.contains(&info.ping_id) => {
                running.remove(&info.ping_id);
            }
            _ => {}
        }
    }

    Ok(())
}

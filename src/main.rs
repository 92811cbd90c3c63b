//! tun-dispatch: Tunnel dispatch and session engine
//!
//! This is the main entry point for the dispatch daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./tun-dispatch
//!
//! # Run with custom configuration
//! ./tun-dispatch -c /path/to/config.json
//!
//! # Run with environment overrides
//! TUN_DISPATCH_LOG_LEVEL=debug ./tun-dispatch
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use tun_dispatch::config::{load_config_with_env, Config};
use tun_dispatch::connection::Manager;
use tun_dispatch::fakedns::{FakeDnsResolver, FakeDnsServer};
use tun_dispatch::tunnel::Tunnel;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-dispatch/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun-dispatch v{}", tun_dispatch::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"tun-dispatch v{}

Tunnel dispatch and session engine for user-space TCP/IP stacks.

USAGE:
    tun-dispatch [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-dispatch/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    TUN_DISPATCH_LOG_LEVEL     Override log level (trace, debug, info, warn, error)
    TUN_DISPATCH_UDP_TIMEOUT   Override UDP session idle timeout in seconds
    TUN_DISPATCH_UDP_WORKERS   Override number of UDP shard workers
    TUN_DISPATCH_DNS_LISTEN    Override fake DNS listen address
    RUST_LOG                   Full tracing filter, takes precedence over the log level

PACKET SOURCE:
    A `device` section creates a TUN interface and dispatches its traffic.
    This requires a build with `--features ipstack` and CAP_NET_ADMIN.
    Without a device the daemon only serves fake DNS on `fakedns.listen`.

EXAMPLE:
    # Dispatch tun0 traffic and hijack its port 53 queries
    tun-dispatch -c /etc/tun-dispatch/config.json
",
        tun_dispatch::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_span_events(FmtSpan::CLOSE);

    if config.log.is_json() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Build the fake-IP resolver and start its DNS server when configured
async fn start_fakedns(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<Option<Arc<FakeDnsResolver>>> {
    if !config.fakedns.enabled {
        return Ok(None);
    }

    let resolver = Arc::new(
        FakeDnsResolver::new(&config.fakedns).context("Failed to create fake DNS resolver")?,
    );
    info!(
        "Fake DNS enabled: pool {}, hijack {}",
        config.fakedns.ipv4_pool, config.fakedns.hijack
    );

    if let Some(listen) = config.fakedns.listen {
        let server = FakeDnsServer::bind(listen, Arc::clone(&resolver))
            .await
            .with_context(|| format!("Failed to bind fake DNS server on {listen}"))?;
        info!("Fake DNS server listening on {}", server.local_addr()?);
        tokio::spawn(server.run(shutdown.clone()));
    }

    Ok(Some(resolver))
}

/// Build the dispatch engine and attach it to the configured packet source
///
/// Returns `None` when no packet source is configured and the daemon only
/// serves fake DNS. A tunnel that nothing feeds is never started.
fn start_tunnel(
    config: &Config,
    manager: &Arc<Manager>,
    resolver: Option<&Arc<FakeDnsResolver>>,
) -> Result<Option<Arc<Tunnel>>> {
    let Some(device) = config.device.as_ref() else {
        if config.fakedns.listen.is_some() {
            warn!("No device configured, serving fake DNS only");
            return Ok(None);
        }
        anyhow::bail!("Nothing to do: configure `device` or `fakedns.listen`");
    };

    #[cfg(not(feature = "ipstack"))]
    {
        let _ = (manager, resolver);
        anyhow::bail!(
            "Device {} is configured but this build lacks the `ipstack` feature",
            device.name
        );
    }

    #[cfg(feature = "ipstack")]
    {
        let stack = tun_dispatch::stack::open_stack(device)
            .with_context(|| format!("Failed to open device {}", device.name))?;

        let dialer =
            tun_dispatch::dialer::from_config(&config.dialer, config.tunnel.tcp_connect_timeout());
        let mut builder = Tunnel::builder()
            .config(config.tunnel.clone())
            .dialer(dialer)
            .manager(Arc::clone(manager))
            .hijack_dns(config.fakedns.hijack);
        if let Some(resolver) = resolver {
            builder = builder.resolver(Arc::clone(resolver));
        }
        let tunnel = Arc::new(
            builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create tunnel: {}", e))?,
        );
        tunnel.process();
        tokio::spawn(tun_dispatch::stack::serve(stack, Arc::clone(&tunnel)));

        info!(
            "Dispatching {} (dialer: {}, UDP workers: {}, UDP timeout: {:?})",
            device.name,
            config.dialer.kind,
            tunnel.shard_count(),
            tunnel.udp_timeout()
        );
        Ok(Some(tunnel))
    }
}

/// Periodically log traffic rates and totals
fn spawn_traffic_log(tunnel: &Arc<Tunnel>, config: &Config, shutdown: CancellationToken) {
    let Some(interval) = config.stats.log_interval() else {
        return;
    };

    let tunnel = Arc::clone(tunnel);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let manager = tunnel.manager();
                    let (up, down) = manager.now();
                    let stats = tunnel.stats().snapshot();
                    info!(
                        connections = manager.connection_count(),
                        nat_sessions = tunnel.nat().len(),
                        udp_dropped = stats.udp_dropped,
                        dial_failures = stats.dial_failures,
                        "Traffic: up {} B/s, down {} B/s",
                        up,
                        down
                    );
                }
            }
        }
        debug!("traffic log stopped");
    });
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        tun_dispatch::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config);

    info!("tun-dispatch v{}", tun_dispatch::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let shutdown = CancellationToken::new();

    // Traffic accounting
    let manager = Arc::new(Manager::new());
    let sampler = manager.spawn_sampler(config.stats.sample_interval(), shutdown.clone());

    // Fake DNS
    let resolver = start_fakedns(&config, &shutdown).await?;

    // Dispatch engine, fed by the TUN device
    let tunnel = start_tunnel(&config, &manager, resolver.as_ref())?;
    if let Some(tunnel) = &tunnel {
        spawn_traffic_log(tunnel, &config, shutdown.clone());
    }

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Graceful shutdown
    info!("Shutting down...");

    let closed = manager.close_all();
    if let Some(tunnel) = &tunnel {
        tunnel.close();
    }
    shutdown.cancel();

    if tokio::time::timeout(std::time::Duration::from_secs(5), sampler)
        .await
        .is_err()
    {
        warn!("Traffic sampler did not stop in time");
    }

    // Log final stats
    if let Some(tunnel) = &tunnel {
        let stats = tunnel.stats().snapshot();
        info!(
            "Final stats: {} TCP accepted, {} UDP sessions, {} UDP dropped, {} dial failures, {} connections closed",
            stats.tcp_accepted, stats.udp_sessions, stats.udp_dropped, stats.dial_failures, closed
        );
    }
    info!(
        "Transferred: {} bytes up, {} bytes down",
        manager.upload_total(),
        manager.download_total()
    );

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await;
}

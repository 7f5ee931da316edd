use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use homeguard::bus::{BusConnection, BusEvent, EmptyInventory};
use homeguard::{HomeguardConfig, SecurityController};

#[derive(Parser, Debug)]
#[command(name = "homeguard")]
#[command(about = "Home-automation security controller with camera workers")]
#[command(version)]
#[command(
    long_about = "A home-automation security controller that arms and disarms zones under \
housemodes, dispatches alarm notifications to sms/smtp/twitter/push gateways, and runs \
per-camera timelapse recording and motion detection workers."
)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "homeguard.toml",
        help = "Path to TOML configuration file"
    )]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting homeguard v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match HomeguardConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate()?;

    let (bus, receiver) = BusConnection::new(config.bus.channel_capacity);

    let controller = SecurityController::new(
        &config,
        PathBuf::from(&args.config),
        bus.clone(),
        Arc::new(EmptyInventory),
        homeguard::video::capture::default_backend(),
        homeguard::video::writer::default_backend(),
    )
    .await
    .map_err(|e| {
        error!("Failed to start controller: {}", e);
        e
    })?;

    // minute tick driving gateway refresh and daily timelapse rotation
    let clock_bus = bus.clone();
    tokio::spawn(async move {
        let mut last_minute = None;
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            let now = chrono::Local::now();
            let stamp = (chrono::Timelike::hour(&now), chrono::Timelike::minute(&now));
            if last_minute != Some(stamp) {
                last_minute = Some(stamp);
                clock_bus.emit(
                    "clock",
                    BusEvent::TimeChanged {
                        hour: stamp.0,
                        minute: stamp.1,
                    },
                );
            }
        }
    });

    // shut down cleanly on ctrl-c
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_token.cancel();
        }
    });

    controller.run(receiver, shutdown).await;
    info!("Homeguard exited");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("homeguard={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        Some("compact") => fmt::layer().compact().with_target(false).boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
        None => fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Homeguard Configuration File");
    println!("# These are the built-in defaults; override in TOML or env vars");
    println!();

    let default_config = HomeguardConfig::default();
    match toml::to_string_pretty(&default_config) {
        Ok(toml_str) => println!("{}", toml_str),
        Err(e) => eprintln!("Failed to render default config: {}", e),
    }
}

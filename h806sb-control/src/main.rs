use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;

use h806sb_control_lib::config::ControlConfig;
use h806sb_control_lib::control_interface::ControlInterface;
use h806sb_control_lib::util::discovery::{DeviceIdentity, Discovery};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "h806sb_control",
    about = "Controls H806SB LED strip drivers",
    version
)]
pub struct Cli {
    /// YAML file with ports and timeouts
    #[clap(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for device information.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Searches the local network for a driver
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds
        #[clap(short = 't', long = "timeout", value_parser = parse_duration)]
        timeout: Option<Duration>,
    },
    /// Discovers a driver and checks that it answers a liveness probe
    #[clap(name = "setup")]
    Setup {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,
    },
    /// Subcommand for operations on a known driver
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address or host name of the driver
        #[clap(long)]
        ip: String,

        /// Sets the serial number of the driver in hex, e.g. 0C3951
        #[clap(long)]
        serial: String,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Prints the effective configuration as YAML
    #[clap(name = "print-config")]
    PrintConfig,
}

fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let millis = s
        .parse::<u64>()
        .map_err(|_| "could not parse duration in milliseconds")?;
    Ok(Duration::from_millis(millis))
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Checks whether the driver answers.
    #[clap(name = "check")]
    Check,
    /// Turns the strip on.
    #[clap(name = "on")]
    On {
        /// Brightness (0-255)
        #[clap(short, long)]
        brightness: Option<u8>,

        /// Effect speed (1-100)
        #[clap(short, long, value_parser = clap::value_parser!(u8).range(1..=100))]
        speed: Option<u8>,
    },
    /// Turns the strip off.
    #[clap(name = "off")]
    Off,
    /// Sets the effect speed.
    #[clap(name = "speed")]
    Speed {
        /// Effect speed (1-100)
        #[clap(value_parser = clap::value_parser!(u8).range(1..=100))]
        speed: u8,
    },
    /// Keeps probing the driver and reports when its availability changes.
    #[clap(name = "watch")]
    Watch {
        /// Time between probes in milliseconds
        #[clap(long, value_parser = parse_duration)]
        interval: Option<Duration>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<ControlConfig> {
    match path {
        Some(path) => ControlConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ControlConfig::default()),
    }
}

fn print_device(device: &DeviceIdentity, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Plaintext => {
            Discovery::pretty_print_device(device);
        }
        OutputFormat::Json => print_json(device)?,
        OutputFormat::Yaml => print_yaml(device)?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    println!("{}", json);
    Ok(())
}

fn print_yaml<T: Serialize>(value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value)?;
    println!("{}", yaml);
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config)?;

    match cli.command {
        Commands::Discover { output, timeout } => {
            if let Some(timeout) = timeout {
                config.discovery_timeout = timeout;
            }
            match ControlInterface::discover(&config).await {
                Some(device) => print_device(&device, output)?,
                None => {
                    return Err(anyhow!(
                        "No device found. If the device is missing, try increasing the search timeout."
                    ))
                }
            }
        }
        Commands::Setup { output } => {
            let control = ControlInterface::verify_then_create(config).await?;
            if let Some(device) = control.identity() {
                print_device(device, output)?;
            }
            control.close().await;
        }
        Commands::PrintConfig => {
            print_yaml(&config)?;
        }
        Commands::DeviceCall { ip, serial, action } => {
            if let DeviceAction::Watch {
                interval: Some(interval),
            } = &action
            {
                config.poll_interval = *interval;
            }
            let control = Arc::new(ControlInterface::new(&ip, &serial, config)?);
            let result = handle_device_action(&control, action).await;
            control.close().await;
            result?;
        }
    }

    Ok(())
}

async fn handle_device_action(control: &Arc<ControlInterface>, action: DeviceAction) -> Result<()> {
    let needs_probe = !matches!(action, DeviceAction::Watch { .. });
    if needs_probe && !control.refresh_availability().await {
        return Err(anyhow!("Device at {} is not responding", control.host));
    }

    match action {
        DeviceAction::Check => {
            println!("Device at {} is available.", control.host);
        }
        DeviceAction::On { brightness, speed } => {
            if let Some(speed) = speed {
                control.set_speed(speed).await?;
            }
            control.turn_on(brightness).await?;
            println!("Device turned on: {:?}", control.light_state().await);
        }
        DeviceAction::Off => {
            control.turn_off().await?;
            println!("Device turned off.");
        }
        DeviceAction::Speed { speed } => {
            control.set_speed(speed).await?;
            println!("Effect speed set to {}", speed);
        }
        DeviceAction::Watch { .. } => watch(control).await?,
    }

    Ok(())
}

async fn watch(control: &Arc<ControlInterface>) -> Result<()> {
    info!(
        "Watching {} every {:?}, press Ctrl-C to stop",
        control.host,
        control.config().poll_interval
    );
    let poll = control.spawn_availability_poll();

    let mut last = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let available = control.is_available();
                if last != Some(available) {
                    println!(
                        "{}: {}",
                        control.host,
                        if available { "available" } else { "unavailable" }
                    );
                    last = Some(available);
                }
            }
        }
    }

    poll.abort();
    Ok(())
}

//! bambu-sdcard CLI - legacy SD card bridge for Bambu Lab printers
//!
//! One-shot commands talk to the printer directly. `serve` reads SD card
//! M-codes from stdin and answers on stdout like a serial printer would.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bambu_sdcard::{
    BambuMqttClient, BridgeConfig, DeleteOutcome, DeviceSnapshot, FtpsClient, FtpsConfig,
    HostCommandExecutor, HostSink, MqttConfig, PrinterCommand, RemoteFileInventory,
    TelemetryChannel, VirtualPrinter,
};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

mod logging;

/// How long `status` waits for the first report.
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "bambu-sdcard")]
#[command(about = "Legacy SD card bridge for Bambu Lab printers", long_about = None)]
struct Cli {
    #[command(flatten)]
    printer: PrinterArgs,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct PrinterArgs {
    /// Path to the bridge configuration file
    #[arg(short, long, global = true, default_value = "bambu-sdcard.toml")]
    config: PathBuf,
    /// Printer host name or IP address
    #[arg(long, global = true)]
    host: Option<String>,
    /// Printer serial number
    #[arg(long, global = true)]
    serial: Option<String>,
    /// LAN access code
    #[arg(long, global = true)]
    access_code: Option<String>,
    /// Printer model, e.g. X1C, P1S, A1
    #[arg(long, global = true)]
    device_type: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List printable files with their short names
    Files,
    /// Start printing a stored file
    Print {
        /// Short name or file name
        name: String,
    },
    /// Pause the running print
    Pause,
    /// Resume a paused print
    Resume,
    /// Cancel the current print
    Cancel,
    /// Delete a stored file
    Delete {
        /// Short name or file name
        name: String,
    },
    /// Show the printer status
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send a single G-code line
    Gcode {
        /// G-code to send, e.g. "M400"
        line: String,
    },
    /// Answer SD card M-codes from stdin on stdout
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    let config = load_config(&cli.printer)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: BridgeConfig) -> Result<()> {
    match command {
        Commands::Files => list_files(&config).await,
        Commands::Print { name } => start_print(&config, &name).await,
        Commands::Pause => send_command(&config, PrinterCommand::Pause).await,
        Commands::Resume => send_command(&config, PrinterCommand::Resume).await,
        Commands::Cancel => send_command(&config, PrinterCommand::Stop).await,
        Commands::Delete { name } => delete_file(&config, &name).await,
        Commands::Status { json } => show_status(&config, json).await,
        Commands::Gcode { line } => send_command(&config, PrinterCommand::GcodeLine(line)).await,
        Commands::Serve => serve(config).await,
    }
}

/// Read the config file if present and apply command line overrides.
fn load_config(args: &PrinterArgs) -> Result<BridgeConfig> {
    let mut config = if args.config.exists() {
        BridgeConfig::load(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?
    } else {
        debug!("no config file at {}, using defaults", args.config.display());
        BridgeConfig::default()
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(serial) = &args.serial {
        config.serial = serial.clone();
    }
    if let Some(access_code) = &args.access_code {
        config.access_code = access_code.clone();
    }
    if let Some(device_type) = &args.device_type {
        config.device_type = device_type.clone();
    }

    config.validate()?;
    Ok(config)
}

fn inventory(config: &BridgeConfig) -> Result<RemoteFileInventory> {
    let fs = FtpsClient::new(FtpsConfig::from_bridge(config))?;
    Ok(RemoteFileInventory::new(Arc::new(fs)))
}

async fn telemetry(config: &BridgeConfig) -> Result<BambuMqttClient> {
    let client = BambuMqttClient::connect(MqttConfig::from_bridge(config)?)
        .await
        .with_context(|| format!("connecting to {}", config.host))?;
    Ok(client)
}

async fn list_files(config: &BridgeConfig) -> Result<()> {
    let files = inventory(config)?.list_all().await?;
    if files.is_empty() {
        println!("No printable files found");
    }
    for file in files {
        println!("{:<14} {:>10}  {}", file.short_name(), file.size(), file.path());
    }
    Ok(())
}

async fn start_print(config: &BridgeConfig, name: &str) -> Result<()> {
    let inventory = inventory(config)?;
    inventory.refresh().await?;
    let Some(file) = inventory.select(name, false).await else {
        bail!("No such file: {}", name);
    };

    let client = telemetry(config).await?;
    let started = publish_selected(&inventory, &client, config).await;
    client.disconnect().await;
    started?;
    println!("Started {}", file.canonical_name());
    Ok(())
}

/// Send the start command for the selected file, the way `M24` does from Idle.
async fn publish_selected(
    inventory: &RemoteFileInventory,
    telemetry: &dyn TelemetryChannel,
    config: &BridgeConfig,
) -> Result<()> {
    let Some(selected) = inventory.selected().await else {
        bail!("No file selected");
    };
    telemetry
        .publish(&PrinterCommand::project_file(&selected, config))
        .await?;
    Ok(())
}

async fn send_command(config: &BridgeConfig, command: PrinterCommand) -> Result<()> {
    let client = telemetry(config).await?;
    client.publish(&command).await?;
    client.disconnect().await;
    println!("Sent {}", command.name());
    Ok(())
}

async fn delete_file(config: &BridgeConfig, name: &str) -> Result<()> {
    let inventory = inventory(config)?;
    inventory.refresh().await?;
    match inventory.delete(name).await {
        DeleteOutcome::Deleted => println!("Deleted {}", name),
        DeleteOutcome::NotFound => bail!("No such file: {}", name),
        DeleteOutcome::Failed(reason) => bail!("Deleting {} failed: {}", name, reason),
    }
    Ok(())
}

async fn show_status(config: &BridgeConfig, json: bool) -> Result<()> {
    let client = telemetry(config).await?;
    let mut updates = client.subscribe();
    let mut snapshot = client.snapshot();
    if snapshot == DeviceSnapshot::default() {
        if let Ok(Ok(first)) = tokio::time::timeout(STATUS_TIMEOUT, updates.recv()).await {
            snapshot = first;
        }
    }
    client.disconnect().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    println!("State:     {:?}", snapshot.state);
    if !snapshot.subtask_name.is_empty() {
        println!("Task:      {}", snapshot.subtask_name);
    }
    println!("Progress:  {}%", snapshot.progress_percent);
    if snapshot.layer_total > 0 {
        println!(
            "Layer:     {}/{}",
            snapshot.layer_current, snapshot.layer_total
        );
    }
    if snapshot.time_remaining_min > 0 {
        println!("Remaining: {} min", snapshot.time_remaining_min);
    }
    Ok(())
}

/// Host replies written to stdout, one line each.
struct StdoutSink;

impl HostSink for StdoutSink {
    fn send_line(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }
}

async fn serve(config: BridgeConfig) -> Result<()> {
    let sink: Arc<dyn HostSink> = Arc::new(StdoutSink);
    let fs = Arc::new(FtpsClient::new(FtpsConfig::from_bridge(&config))?);
    let client = Arc::new(telemetry(&config).await?);
    let serial = client.serial().to_string();

    let printer = Arc::new(VirtualPrinter::new(
        config,
        fs,
        client.clone(),
        sink.clone(),
    ));
    let host = HostCommandExecutor::new(printer.clone(), sink);
    info!(serial = %serial, "serving SD card commands on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    host.execute(&line).await;
                    if host.is_killed() {
                        info!(serial = %serial, "emergency stop, closing");
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    host.shutdown().await;
    printer.shutdown().await;
    client.disconnect().await;
    Ok(())
}

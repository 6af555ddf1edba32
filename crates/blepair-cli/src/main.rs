//! blepair CLI
//!
//! Drives both pairing roles from the command line: scan for responders,
//! advertise and wait as a responder, or connect and pair as an initiator.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use blepair_core::codec::{generate_code, generate_identity, known_identity_prefix};
use blepair_core::{
    AppSettings, BleCentral, BlePeripheral, BleScanner, ConfirmationHook, FragmentScheme,
    Initiator, InitiatorEvents, InitiatorOutcome, MockIssuer, PairingConfig, PairingError,
    PairingRecord, Responder, ResponderEvents,
};

#[derive(Parser)]
#[command(name = "blepair", version, about = "BLE device pairing and credential exchange")]
struct Cli {
    /// Verbose logging (overrides the saved setting)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for advertising responders
    Scan {
        /// Scan timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// Advertise and wait for an initiator (responder role)
    Advertise {
        /// Advertised device name (default: saved setting or hostname)
        #[arg(short, long)]
        name: Option<String>,
        /// Identity prefix: TAB, MOB or DEV
        #[arg(short, long)]
        prefix: Option<String>,
        /// Accept pairing codes without asking
        #[arg(short = 'y', long)]
        auto_confirm: bool,
        /// Accept the legacy start/end-marker credential framing
        #[arg(long)]
        sentinel: bool,
    },
    /// Connect to a responder and pair (initiator role)
    Pair {
        /// Responder address from `blepair scan`
        device: String,
        /// Present this code instead of generating one
        #[arg(short, long)]
        code: Option<String>,
        /// Send the credential with the legacy start/end-marker framing
        #[arg(long)]
        sentinel: bool,
    },
    /// Show or update saved settings
    Config {
        /// New device name
        #[arg(long)]
        name: Option<String>,
        /// New identity prefix
        #[arg(long)]
        prefix: Option<String>,
    },
}

/// Prompts on the terminal for each received code.
struct TerminalConfirm;

#[async_trait::async_trait]
impl ConfirmationHook for TerminalConfirm {
    async fn confirm(&self, code: &str) -> bool {
        println!("🔑 Pairing code: {code}");
        print!("   Accept? [y/N] ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        if reader.read_line(&mut line).await.is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

struct PrintingResponder;

impl ResponderEvents for PrintingResponder {
    fn on_status(&self, status: &str) {
        println!("   {status}");
    }

    fn on_code_received(&self, peer: &str, code: &str) {
        println!("🔑 Code {code} from {peer}");
    }

    fn on_paired(&self, record: &PairingRecord) {
        println!("✅ Paired as {}", record.serial_number);
        println!("   credential: {} bytes", record.jwt_token.len());
    }

    fn on_error(&self, error: &PairingError) {
        eprintln!("⚠️  {error}");
    }
}

struct PrintingInitiator;

impl InitiatorEvents for PrintingInitiator {
    fn on_status(&self, status: &str) {
        println!("   {status}");
    }

    fn on_complete(&self, outcome: &InitiatorOutcome) {
        println!("✅ Paired with {}", outcome.identity);
    }

    fn on_error(&self, error: &PairingError) {
        eprintln!("⚠️  {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = AppSettings::load();

    // bridge the log crate (used by blepair-core) into tracing
    let _ = tracing_log::LogTracer::init();
    let default_filter = if cli.verbose || settings.verbose {
        "debug"
    } else {
        "warn,blepair_core=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    tracing::debug!("loaded settings: {settings:?}");

    match cli.command {
        Commands::Scan { timeout } => scan(timeout).await,
        Commands::Advertise {
            name,
            prefix,
            auto_confirm,
            sentinel,
        } => {
            advertise(
                &settings,
                name,
                prefix,
                auto_confirm || settings.auto_confirm,
                sentinel,
            )
            .await
        }
        Commands::Pair {
            device,
            code,
            sentinel,
        } => pair(&settings, &device, code, sentinel).await,
        Commands::Config { name, prefix } => config(settings, name, prefix),
    }
}

async fn scan(timeout: u64) -> Result<()> {
    println!("🔍 Scanning ({timeout}s)...");
    let scanner = BleScanner::new().await?;
    let devices = scanner.scan(Duration::from_secs(timeout), None).await?;

    if devices.is_empty() {
        println!("   no responders found");
    } else {
        for (i, dev) in devices.iter().enumerate() {
            match dev.rssi {
                Some(rssi) => println!("   [{i}] {} ({}) rssi {rssi}", dev.name, dev.address),
                None => println!("   [{i}] {} ({})", dev.name, dev.address),
            }
        }
    }
    Ok(())
}

async fn advertise(
    settings: &AppSettings,
    name: Option<String>,
    prefix: Option<String>,
    auto_confirm: bool,
    sentinel: bool,
) -> Result<()> {
    let config = PairingConfig {
        device_name: name.unwrap_or_else(|| settings.device_name.clone()),
        fragment_scheme: if sentinel {
            FragmentScheme::Sentinel
        } else {
            FragmentScheme::Indexed
        },
        ..PairingConfig::default()
    };
    let identity = generate_identity(&prefix.unwrap_or_else(|| settings.identity_prefix.clone()))?;

    let mut peripheral = BlePeripheral::new().await?;
    let writes = peripheral
        .take_write_receiver()
        .expect("fresh peripheral always has its write stream");

    println!("📡 Advertising as '{}', identity {identity}", config.device_name);
    let mut responder = Responder::new(Arc::new(peripheral), identity, config);
    if !auto_confirm {
        responder = responder.with_confirmation(Arc::new(TerminalConfirm));
    }

    match responder.run(writes, &PrintingResponder).await? {
        Some(record) => {
            println!("{}", record.jwt_token);
            Ok(())
        }
        None => anyhow::bail!("no pairing completed"),
    }
}

async fn pair(
    settings: &AppSettings,
    device: &str,
    code: Option<String>,
    sentinel: bool,
) -> Result<()> {
    let config = PairingConfig {
        device_name: settings.device_name.clone(),
        fragment_scheme: if sentinel {
            FragmentScheme::Sentinel
        } else {
            FragmentScheme::Indexed
        },
        ..PairingConfig::default()
    };

    let central = Arc::new(BleCentral::new(config.clone()).await?);
    let issuer = Arc::new(MockIssuer::new());
    let mut initiator = Initiator::new(central, issuer, config);

    // always show the code so the responder side can be matched against it
    let code = code.unwrap_or_else(generate_code);
    println!("📶 Pairing with {device}");
    println!("🔑 Presenting code {code}");
    let outcome = initiator
        .pair_with_code(device, &code, &PrintingInitiator)
        .await?;

    println!("{}", outcome.credential);
    Ok(())
}

fn config(mut settings: AppSettings, name: Option<String>, prefix: Option<String>) -> Result<()> {
    let changed = name.is_some() || prefix.is_some();
    if let Some(name) = name {
        settings.device_name = name;
    }
    if let Some(prefix) = prefix {
        let prefix = prefix.to_uppercase();
        anyhow::ensure!(
            known_identity_prefix(&prefix),
            "unknown identity prefix {prefix:?}, expected TAB, MOB or DEV"
        );
        settings.identity_prefix = prefix;
    }
    if changed {
        settings.save()?;
        println!("Settings saved");
    }

    println!("device_name     = {}", settings.device_name);
    println!("identity_prefix = {}", settings.identity_prefix);
    println!("auto_confirm    = {}", settings.auto_confirm);
    println!("verbose         = {}", settings.verbose);
    Ok(())
}

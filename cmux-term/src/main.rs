//! cmux terminal
//!
//! Runs a GSM 07.10 multiplexer over a serial port and bridges one of its
//! channels to the terminal.

mod ports;
mod settings;
mod terminal;

use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "cmux-term", version, about = "GSM 07.10 multiplexer terminal")]
struct Cli {
    /// Serial port to open
    #[arg(long, short = 'p', env = "CMUX_PORT")]
    port: Option<String>,

    /// Baud rate
    #[arg(long, short = 'b')]
    baud: Option<u32>,

    /// Channel to establish (repeatable); stdin goes to the first
    #[arg(long = "dlci", value_name = "ID")]
    dlcis: Vec<u8>,

    /// SABM response timeout in milliseconds
    #[arg(long, value_name = "MS")]
    t1: Option<u64>,

    /// SABM retransmissions
    #[arg(long, value_name = "COUNT")]
    retransmits: Option<u8>,

    /// Settings file (defaults to the user config directory)
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

impl Cli {
    /// Command-line values override the loaded settings
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = &self.port {
            settings.port = port.clone();
        }
        if let Some(baud) = self.baud {
            settings.baud_rate = baud;
        }
        if !self.dlcis.is_empty() {
            settings.dlcis = self.dlcis.clone();
        }
        if let Some(t1) = self.t1 {
            settings.mux.t1_timeout_ms = t1;
        }
        if let Some(retransmits) = self.retransmits {
            settings.mux.retransmit_count = retransmits;
        }
    }

    fn load_settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) => Settings::load_from(path)?,
            None => Settings::load(),
        };
        self.apply(&mut settings);
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries channel data
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cmux_term=info,cmux=info,cmux_protocol=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if cli.list_ports {
        for port in ports::enumerate()? {
            println!("{}\t{}", port.port, port.description);
        }
        return Ok(());
    }

    let settings = cli.load_settings()?;
    settings.mux.validate()?;

    if cli.save {
        let Some(path) = cli.settings.clone().or_else(Settings::default_path) else {
            bail!("Could not determine settings path");
        };
        settings.save_to(&path)?;
        tracing::info!("Saved settings to {}", path.display());
    }

    if settings.port.is_empty() {
        bail!("No serial port given; pass --port or set it in the settings file");
    }

    tracing::info!("Starting cmux-term on {}", settings.port);
    terminal::run(&settings).await
}

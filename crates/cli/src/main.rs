//! usbhid CLI: list HID interfaces and exchange reports with them.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use usbhid_core::config::SessionConfig;
use usbhid_core::{DeviceSession, HidContext};

/// Parse a hex payload such as `"01 02 ff"`, `"0102ff"` or `"0x01,0x02"`.
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let mut digits = String::new();
    for token in input.split(|c: char| c.is_whitespace() || c == ',' || c == ':') {
        let token = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if let Some(bad) = token.chars().find(|c| !c.is_ascii_hexdigit()) {
            bail!("invalid hex digit '{bad}' in '{input}'");
        }
        if token.len() % 2 == 1 {
            digits.push('0');
        }
        digits.push_str(token);
    }

    if digits.is_empty() {
        bail!("empty hex payload");
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn parse_u16_hex(input: &str) -> Result<u16> {
    let digits = input.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).with_context(|| format!("invalid hex id '{input}'"))
}

/// Device selector given as `VID:PID[:SERIAL]` (ids in hex).
#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceSpec {
    vendor_id: u16,
    product_id: u16,
    serial: Option<String>,
}

fn parse_device_spec(input: &str) -> Result<DeviceSpec> {
    let mut parts = input.splitn(3, ':');
    let (Some(vid), Some(pid)) = (parts.next(), parts.next()) else {
        bail!("expected VID:PID[:SERIAL], got '{input}'");
    };
    Ok(DeviceSpec {
        vendor_id: parse_u16_hex(vid)?,
        product_id: parse_u16_hex(pid)?,
        serial: parts.next().map(str::to_string),
    })
}

fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Args, Debug)]
struct Target {
    /// Device path as printed by `list`.
    #[arg(long, conflicts_with = "device")]
    path: Option<String>,
    /// Device as VID:PID[:SERIAL] (hex ids).
    #[arg(long, value_parser = parse_device_spec)]
    device: Option<DeviceSpec>,
}

impl Target {
    fn open(&self, ctx: &HidContext) -> Result<DeviceSession> {
        match (&self.path, &self.device) {
            (Some(path), _) => ctx
                .open_path(path)
                .with_context(|| format!("open {path}")),
            (None, Some(spec)) => ctx
                .open(spec.vendor_id, spec.product_id, spec.serial.as_deref())
                .with_context(|| {
                    format!(
                        "open device (VID=0x{:04X} PID=0x{:04X})",
                        spec.vendor_id, spec.product_id
                    )
                }),
            (None, None) => bail!("specify a device with --path or --device"),
        }
    }
}

#[derive(Parser)]
#[command(name = "usbhid", version, about = "Talk to USB HID devices")]
struct Cli {
    /// JSON file overriding session settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List HID interfaces.
    List {
        /// Only this vendor id (hex).
        #[arg(long, value_parser = parse_u16_hex)]
        vid: Option<u16>,
        /// Only this product id (hex).
        #[arg(long, value_parser = parse_u16_hex)]
        pid: Option<u16>,
        /// Print JSON instead of one line per interface.
        #[arg(long)]
        json: bool,
    },
    /// Show the full record of one interface.
    Info {
        #[command(flatten)]
        target: Target,
    },
    /// Print incoming input reports.
    Read {
        #[command(flatten)]
        target: Target,
        /// Milliseconds to wait per report (-1 waits forever).
        #[arg(long, default_value_t = 1000, allow_hyphen_values = true)]
        timeout: i32,
        /// Stop after this many reports.
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Send an output report. The first byte is the report id.
    Write {
        #[command(flatten)]
        target: Target,
        data: String,
    },
    /// Fetch a feature report.
    GetFeature {
        #[command(flatten)]
        target: Target,
        /// Report id (0 if the device uses none).
        report_id: u8,
        /// Buffer size, including the report id byte.
        len: usize,
    },
    /// Send a feature report. The first byte is the report id.
    SendFeature {
        #[command(flatten)]
        target: Target,
        data: String,
    },
    /// Fetch an input report over the control endpoint.
    GetInput {
        #[command(flatten)]
        target: Target,
        report_id: u8,
        len: usize,
    },
    /// Dump the report descriptor.
    Descriptor {
        #[command(flatten)]
        target: Target,
    },
}

fn report_buffer(report_id: u8, len: usize) -> Result<Vec<u8>> {
    if len == 0 {
        bail!("buffer length must be at least 1");
    }
    let mut buf = vec![0u8; len];
    buf[0] = report_id;
    Ok(buf)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    debug!(?config, "session settings");
    let ctx = HidContext::with_config(config)?;

    match cli.command {
        Commands::List { vid, pid, json } => {
            let devices = ctx.enumerate(vid.unwrap_or(0), pid.unwrap_or(0));
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No HID devices found.");
                println!("Check the device is connected and you may access it.");
            } else {
                for dev in &devices {
                    println!("{dev}");
                }
            }
        }
        Commands::Info { target } => {
            let session = target.open(&ctx)?;
            let info = session.device_info()?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            println!("quirks: {}", serde_json::to_string(session.quirks())?);
        }
        Commands::Read {
            target,
            timeout,
            count,
        } => {
            let session = target.open(&ctx)?;
            let mut buf = [0u8; 4096];
            for _ in 0..count {
                let n = session.read_timeout(&mut buf, timeout)?;
                if n == 0 {
                    println!("(timeout)");
                } else {
                    println!("{}", format_hex(&buf[..n]));
                }
            }
        }
        Commands::Write { target, data } => {
            let payload = parse_hex(&data)?;
            let session = target.open(&ctx)?;
            let n = session.write(&payload)?;
            println!("Wrote {n} bytes");
        }
        Commands::GetFeature {
            target,
            report_id,
            len,
        } => {
            let mut buf = report_buffer(report_id, len)?;
            let session = target.open(&ctx)?;
            let n = session.get_feature_report(&mut buf)?;
            println!("{}", format_hex(&buf[..n.min(buf.len())]));
        }
        Commands::SendFeature { target, data } => {
            let payload = parse_hex(&data)?;
            let session = target.open(&ctx)?;
            let n = session.send_feature_report(&payload)?;
            println!("Sent {n} bytes");
        }
        Commands::GetInput {
            target,
            report_id,
            len,
        } => {
            let mut buf = report_buffer(report_id, len)?;
            let session = target.open(&ctx)?;
            let n = session.get_input_report(&mut buf)?;
            println!("{}", format_hex(&buf[..n.min(buf.len())]));
        }
        Commands::Descriptor { target } => {
            let session = target.open(&ctx)?;
            let descriptor = session.report_descriptor()?;
            println!("{} bytes", descriptor.len());
            for chunk in descriptor.chunks(16) {
                println!("{}", format_hex(chunk));
            }
        }
    }

    ctx.shutdown();
    Ok(())
}

//! Writing images to the device with esptool.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DeployConfig;
use crate::process::{Cmd, CommandRunner, SystemRunner};

/// Substrings identifying USB-serial bridges in a port description.
pub const USB_SERIAL_MARKERS: &[&str] = &["USB", "Serial", "CP210"];

const SERIAL_BY_ID: &str = "/dev/serial/by-id";

/// Friendly names of Plug and Play devices bound to a COM port.
const PNP_QUERY: &str = r"Get-CimInstance Win32_PnPEntity | Where-Object { $_.Name -match '\(COM[0-9]+\)' } | ForEach-Object { $_.Name }";

/// A serial port the host can see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Path or name handed to esptool (`/dev/ttyUSB0`, `COM3`).
    pub device: String,
    /// Human-readable description used for matching.
    pub description: String,
}

/// Lists serial ports available on the host.
pub trait PortScanner {
    fn ports(&self) -> Vec<SerialPortInfo>;
}

/// Reads `/dev/serial/by-id`, whose link names carry the USB descriptor,
/// e.g. `usb-Silicon_Labs_CP2102_USB_to_UART_Bridge-if00-port0`.
///
/// Hosts without that directory report no ports.
#[derive(Debug, Clone)]
pub struct SysfsPortScanner {
    by_id_dir: PathBuf,
}

impl Default for SysfsPortScanner {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from(SERIAL_BY_ID),
        }
    }
}

impl SysfsPortScanner {
    pub fn with_dir(dir: &Path) -> Self {
        Self {
            by_id_dir: dir.to_path_buf(),
        }
    }
}

impl PortScanner for SysfsPortScanner {
    fn ports(&self) -> Vec<SerialPortInfo> {
        let Ok(entries) = fs::read_dir(&self.by_id_dir) else {
            return Vec::new();
        };

        let mut ports: Vec<SerialPortInfo> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let link = entry.path();
                let description = entry.file_name().to_str()?.replace('_', " ");
                let device = fs::canonicalize(&link).unwrap_or(link);
                Some(SerialPortInfo {
                    device: device.to_string_lossy().into_owned(),
                    description,
                })
            })
            .collect();
        ports.sort_by(|a, b| a.device.cmp(&b.device));
        ports
    }
}

/// Windows scanner. Device friendly names carry the port in parentheses, e.g.
/// `Silicon Labs CP210x USB to UART Bridge (COM3)`.
///
/// A failed query reports no ports.
#[derive(Debug, Clone, Default)]
pub struct PnpPortScanner<R> {
    runner: R,
}

impl<R: CommandRunner> PnpPortScanner<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> PortScanner for PnpPortScanner<R> {
    fn ports(&self) -> Vec<SerialPortInfo> {
        match self.runner.run(&pnp_query_command()) {
            Ok(result) if result.success() => parse_pnp_names(&result.stdout),
            _ => Vec::new(),
        }
    }
}

pub fn pnp_query_command() -> Cmd {
    Cmd::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", PNP_QUERY])
        .description("List serial ports")
}

/// One port per line that ends in `(COMn)`, in the order listed.
pub fn parse_pnp_names(output: &str) -> Vec<SerialPortInfo> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.trim();
            let start = name.rfind("(COM")?;
            let end = start + name[start..].find(')')?;
            Some(SerialPortInfo {
                device: name[start + 1..end].to_string(),
                description: name.to_string(),
            })
        })
        .collect()
}

/// The scanner for the platform this binary runs on.
pub fn host_scanner() -> Box<dyn PortScanner> {
    if cfg!(windows) {
        Box::new(PnpPortScanner::new(SystemRunner))
    } else {
        Box::new(SysfsPortScanner::default())
    }
}

/// Fixed port list, for hosts where ports are known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticPorts(pub Vec<SerialPortInfo>);

impl PortScanner for StaticPorts {
    fn ports(&self) -> Vec<SerialPortInfo> {
        self.0.clone()
    }
}

/// First port whose description names a USB-serial bridge.
pub fn detect_port(scanner: &dyn PortScanner) -> Option<String> {
    scanner
        .ports()
        .into_iter()
        .find(|port| {
            USB_SERIAL_MARKERS
                .iter()
                .any(|marker| port.description.contains(marker))
        })
        .map(|port| port.device)
}

/// Configured port, else a detected one, else the configured default.
pub fn upload_port(config: &DeployConfig, scanner: &dyn PortScanner) -> String {
    if let Some(port) = &config.upload_port {
        return port.clone();
    }
    detect_port(scanner).unwrap_or_else(|| config.default_port.clone())
}

/// `python -m esptool --chip <chip> --port <port> --baud <baud> write_flash <offset> <image>`
pub fn flash_command(config: &DeployConfig, port: &str, offset: u32, image: &Path) -> Cmd {
    Cmd::new(&config.python)
        .args(["-m", "esptool", "--chip", config.chip.as_str(), "--port", port])
        .args(["--baud".to_string(), config.baud.to_string()])
        .args(["write_flash".to_string(), format_offset(offset)])
        .arg_path(image)
        .current_dir(&config.project_dir)
}

/// Write `image` at `offset`.
pub fn flash_image(
    config: &DeployConfig,
    runner: &dyn CommandRunner,
    scanner: &dyn PortScanner,
    label: &str,
    offset: u32,
    image: &Path,
) -> Result<()> {
    let port = upload_port(config, scanner);
    println!("Using upload port: {port}");

    flash_command(config, &port, offset, image)
        .description(&format!("Upload {label} to {}", format_offset(offset)))
        .run(runner)
        .with_context(|| format!("Failed to upload {label}"))?;
    Ok(())
}

/// `0x810000` style rendering used in logs and on the esptool command line.
pub fn format_offset(offset: u32) -> String {
    format!("0x{offset:X}")
}

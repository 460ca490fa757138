use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use noox_deploy::compress::{self, WEB_ASSETS};
use noox_deploy::exit::{codes, exit_code};
use noox_deploy::flash::{detect_port, host_scanner, upload_port};
use noox_deploy::{preflight, ui, DeployConfig, Deployer, InterruptFlag, SystemRunner};

fn usage() -> &'static str {
    "Usage:\n  noox-deploy deploy [--project <dir>]\n  noox-deploy compress [--all] [--project <dir>]\n  noox-deploy ports [--project <dir>]\n  noox-deploy help"
}

enum Command {
    Deploy,
    Compress { all: bool },
    Ports,
    Help,
}

struct Invocation {
    command: Command,
    project: PathBuf,
}

/// A failed command. The deployment pipeline prints its own errors before
/// cleanup, so those are not printed a second time.
enum Failure {
    Unreported(anyhow::Error),
    Reported(anyhow::Error),
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Failure::Unreported(err)
    }
}

impl Failure {
    fn error(&self) -> &anyhow::Error {
        match self {
            Failure::Unreported(err) | Failure::Reported(err) => err,
        }
    }

    fn needs_report(&self) -> bool {
        matches!(self, Failure::Unreported(_)) && exit_code(self.error()) != codes::INTERRUPTED
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let invocation = match parse_args(&args) {
        Ok(invocation) => invocation,
        Err(err) => {
            ui::error(&format!("{err:#}"));
            eprintln!("{}", usage());
            std::process::exit(codes::USAGE);
        }
    };

    let code = match dispatch(invocation) {
        Ok(()) => codes::SUCCESS,
        Err(failure) => {
            if failure.needs_report() {
                ui::error(&format!("{:#}", failure.error()));
            }
            exit_code(failure.error())
        }
    };
    std::process::exit(code);
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut project = None;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--project" | "-C" => {
                let Some(dir) = iter.next() else {
                    bail!("--project requires a directory");
                };
                project = Some(PathBuf::from(dir));
            }
            other => positional.push(other),
        }
    }

    let command = match positional.as_slice() {
        [] | ["deploy"] => Command::Deploy,
        ["compress"] => Command::Compress { all: false },
        ["compress", "--all"] => Command::Compress { all: true },
        ["ports"] => Command::Ports,
        ["help"] | ["--help"] | ["-h"] => Command::Help,
        other => bail!("unrecognized arguments: '{}'", other.join(" ")),
    };

    let project = match project {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    Ok(Invocation { command, project })
}

fn dispatch(invocation: Invocation) -> Result<(), Failure> {
    match invocation.command {
        Command::Help => {
            println!("{}", usage());
            Ok(())
        }
        Command::Deploy => deploy(&invocation.project),
        Command::Compress { all } => Ok(compress_only(&invocation.project, all)?),
        Command::Ports => Ok(list_ports(&invocation.project)?),
    }
}

fn deploy(project: &Path) -> Result<(), Failure> {
    let interrupt = InterruptFlag::install();
    let config = DeployConfig::load(project)?;
    preflight::check_deploy_host(&config)?;

    let ports = host_scanner();
    Deployer::new(&config, &SystemRunner, &*ports, interrupt)
        .run()
        .map_err(Failure::Reported)?;
    Ok(())
}

fn compress_only(project: &Path, all: bool) -> Result<()> {
    let config = DeployConfig::load(project)?;
    let source = config.source_path();
    if all {
        let output = config.staging_path();
        compress::compress_directory(&source, &output)?;
    } else {
        compress::compress_assets(&source, &config.littlefs_path(), WEB_ASSETS)?;
        println!("\nWeb files are ready for LittleFS deployment.");
        println!("Run: noox-deploy deploy");
    }
    Ok(())
}

fn list_ports(project: &Path) -> Result<()> {
    let config = DeployConfig::load(project)?;
    let scanner = host_scanner();

    let ports = scanner.ports();
    if ports.is_empty() {
        println!("No serial ports detected.");
    }
    for port in &ports {
        println!("{}  {}", port.device, port.description);
    }
    if detect_port(&*scanner).is_none() && config.upload_port.is_none() {
        ui::warning(&format!(
            "No USB-serial port matched, falling back to {}",
            config.default_port
        ));
    }
    println!("Upload port: {}", upload_port(&config, &*scanner));
    Ok(())
}

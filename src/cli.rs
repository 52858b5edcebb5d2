//! Command line parsing

use crate::config::AppConfig;
use std::path::PathBuf;

/// What the binary should do
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(CliOptions),
    Help,
    Version,
}

/// Overrides collected from the command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOptions {
    pub config_path: Option<PathBuf>,
    pub reference_path: Option<PathBuf>,
    pub room_path: Option<PathBuf>,
    pub history_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub bind_addr: Option<String>,
    pub save_processed: Option<PathBuf>,
}

impl CliOptions {
    /// Apply the overrides on top of `config`
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(path) = &self.reference_path {
            config.reference_path = path.clone();
        }
        if let Some(path) = &self.room_path {
            config.room_path = path.clone();
        }
        if let Some(path) = &self.history_path {
            config.history_path = path.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = &self.bind_addr {
            config.bind_addr = addr.clone();
        }
    }
}

/// Parse arguments (without the program name)
pub fn parse<I, S>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let mut options = CliOptions::default();
    let mut i = 0;

    while i < args.len() {
        let flag = args[i].as_str();
        let value = || {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| format!("{} requires a value", flag))
        };
        match flag {
            "--help" | "-h" => return Ok(Command::Help),
            "--version" | "-v" => return Ok(Command::Version),
            "--config" | "-c" => options.config_path = Some(value()?.into()),
            "--ref" => options.reference_path = Some(value()?.into()),
            "--room" => options.room_path = Some(value()?.into()),
            "--history" => options.history_path = Some(value()?.into()),
            "--log-dir" => options.log_dir = Some(value()?.into()),
            "--bind" => options.bind_addr = Some(value()?),
            "--save-processed" => options.save_processed = Some(value()?.into()),
            "--port" | "-p" => {
                let raw = value()?;
                let port = raw
                    .parse()
                    .map_err(|_| format!("Invalid port: {}", raw))?;
                options.port = Some(port);
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
        i += 2;
    }

    Ok(Command::Run(options))
}

pub fn print_help() {
    println!("Usage: roomtester [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH          Config file (default: <data_dir>/roomtester/config.json)");
    println!("      --ref PATH             Reference recording (default: ref.wav)");
    println!("      --room PATH            Room recording (default: room.wav)");
    println!("      --history PATH         Meter history file (default: meter_history.json)");
    println!("      --log-dir DIR          Session log directory (default: logs)");
    println!("  -p, --port PORT            HTTP port (default: 5000)");
    println!("      --bind ADDR            Bind address (default: 0.0.0.0)");
    println!("      --save-processed PATH  Also write the processed source as 16-bit WAV");
    println!("  -v, --version              Show version");
    println!("  -h, --help                 Show this help");
    println!();
    println!("Examples:");
    println!("  roomtester --ref sweep.wav --room hall.wav");
    println!("  roomtester -p 8080 --save-processed processed.wav");
}

//! CommWatch command line: record, replay, and monitor wire traffic.
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::info;

use commwatch::adapter::OpenOptions;
use commwatch::device::{DeviceInfo, DeviceType};
use commwatch::event::Event;
use commwatch::export;
use commwatch::session::Session;
use commwatch::simulator::SimulatorConfig;

#[derive(Parser)]
#[command(name = "commwatch", version, about = "Observe, decode, and replay wire traffic")]
struct Opt {
    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Target {
    /// Transport family.
    #[arg(long)]
    proto: DeviceType,

    /// Serial device path, e.g. /dev/ttyUSB0.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate for UART.
    #[arg(long)]
    baud: Option<u32>,

    /// CAN or network interface name.
    #[arg(long)]
    iface: Option<String>,

    /// UDP/TCP port number.
    #[arg(long)]
    eth_port: Option<u16>,

    /// Remote host, selects client mode.
    #[arg(long)]
    host: Option<String>,

    /// Use a simulator instead of hardware.
    #[arg(long)]
    sim: bool,

    /// Simulator mode: loopback or burst.
    #[arg(long, default_value = "burst")]
    sim_mode: String,
}

#[derive(Subcommand)]
enum Command {
    /// Capture traffic and write a JSON session log.
    Record {
        #[command(flatten)]
        target: Target,

        /// Capture length in seconds.
        #[arg(long, default_value_t = 5)]
        duration: u64,

        /// Output file.
        #[arg(long, default_value = "session.json")]
        out: PathBuf,
    },
    /// Retransmit the tx frames of a recorded session.
    Replay {
        #[command(flatten)]
        target: Target,

        /// JSON session log produced by record.
        #[arg(long)]
        input: PathBuf,

        /// Delay scale; 2.0 replays twice as fast.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    /// Print decoded frames as they arrive.
    Monitor {
        #[command(flatten)]
        target: Target,

        /// How long to watch, in seconds.
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
}

impl Target {
    fn options(&self) -> OpenOptions {
        OpenOptions {
            baud_rate: self.baud,
            eth_port: self.eth_port,
            eth_host: self.host.clone(),
            ..Default::default()
        }
    }

    fn locator(&self) -> Option<String> {
        self.port.clone().or_else(|| self.iface.clone())
    }

    fn simulator_config(&self) -> Result<SimulatorConfig> {
        match self.sim_mode.as_str() {
            "loopback" => Ok(SimulatorConfig::loopback()),
            "burst" => Ok(SimulatorConfig::burst(100, 1)),
            other => anyhow::bail!("unknown simulator mode {other:?}"),
        }
    }

    fn connect(&self, session: &mut Session) -> Result<()> {
        match self.locator() {
            Some(path) if !self.sim => {
                let device = DeviceInfo::new(path.clone(), path.clone(), self.proto)
                    .with_path(path);
                session.connect(&device, &self.options())?;
            }
            _ => {
                session.connect_simulator(self.proto, &self.simulator_config()?)?;
            }
        }
        Ok(())
    }
}

fn frame_summary(event: &Event) -> Option<String> {
    let (tag, frame) = match event {
        Event::FrameReceived(f) => ("rx", f),
        Event::FrameSent(f) => ("tx", f),
        _ => return None,
    };
    let hex = commwatch::hex::hex_string(&frame.raw);
    let mut line = format!("{:>6} {} {:4}B  {hex}", frame.id, tag, frame.raw.len());
    if let Some(decoded) = &frame.decoded {
        line.push_str(&format!("  [{}]", decoded.protocol));
    }
    if let Some(error) = &frame.error {
        line.push_str(&format!("  !{}", error.code));
    }
    Some(line)
}

fn monitor(target: &Target, duration: u64) -> Result<()> {
    let mut session = Session::new();
    session.bus().subscribe_all(Box::new(|event| {
        if let Some(line) = frame_summary(event) {
            println!("{line}");
        }
    }));
    target.connect(&mut session)?;
    std::thread::sleep(Duration::from_secs(duration));
    if let Some(stats) = session.stats() {
        eprintln!(
            "rx {} frames / {} bytes, tx {} frames, {} errors",
            stats.messages_rx, stats.bytes_rx, stats.messages_tx, stats.errors
        );
    }
    session.disconnect()?;
    Ok(())
}

fn record(target: &Target, duration: u64, out: &PathBuf) -> Result<()> {
    let mut session = Session::new();
    target.connect(&mut session)?;
    info!("recording for {duration}s");
    std::thread::sleep(Duration::from_secs(duration));
    session.disconnect()?;
    let json = session.export_json()?;
    std::fs::write(out, json)?;
    eprintln!("wrote {} frames to {}", session.frame_count(), out.display());
    Ok(())
}

fn replay(target: &Target, input: &PathBuf, speed: f64) -> Result<()> {
    if speed <= 0.0 {
        anyhow::bail!("--speed must be positive");
    }
    let text = std::fs::read_to_string(input)?;
    let file = export::from_json(&text)?;
    let mut session = Session::new();
    target.connect(&mut session)?;
    let mut last_ts: Option<u64> = None;
    let mut sent = 0usize;
    for frame in file
        .frames
        .iter()
        .filter(|f| f.direction == commwatch::frame::Direction::Tx)
    {
        let ts = frame.timestamp_ns()?;
        if let Some(prev) = last_ts {
            let gap = ts.saturating_sub(prev) as f64 / speed;
            std::thread::sleep(Duration::from_nanos(gap as u64));
        }
        last_ts = Some(ts);
        session.send(&frame.raw)?;
        sent += 1;
    }
    eprintln!("replayed {sent} tx frames from {}", input.display());
    session.disconnect()?;
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("commwatch")
        .verbosity(opt.verbose as usize)
        .init()?;
    match &opt.command {
        Command::Record {
            target,
            duration,
            out,
        } => record(target, *duration, out),
        Command::Replay {
            target,
            input,
            speed,
        } => replay(target, input, *speed),
        Command::Monitor { target, duration } => monitor(target, *duration),
    }
}

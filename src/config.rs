use std::net::Ipv4Addr;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{warn, LevelFilter};

use crate::error::{Error, Result};
use crate::net::{self, pcap, MacAddress};
use crate::packet::MetaPacket;

fn parse_duration(arg: &str) -> std::result::Result<Duration, std::num::ParseFloatError> {
    Ok(Duration::from_secs_f64(arg.parse::<f64>()?.max(0.0)))
}

fn parse_millis(arg: &str) -> std::result::Result<Duration, ParseIntError> {
    Ok(Duration::from_millis(arg.parse()?))
}

/// Byte count with an optional K, M or G suffix (powers of 1024).
fn parse_size(arg: &str) -> std::result::Result<u64, ParseIntError> {
    let (digits, scale) = match arg.char_indices().last() {
        Some((at, suffix)) if suffix.is_ascii_alphabetic() => {
            let scale = match suffix.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                _ => {
                    warn!("Unknown size suffix (supported suffixes are G, M and K)");
                    1
                }
            };
            (&arg[..at], scale)
        }
        _ => (arg, 1),
    };
    Ok(digits.parse::<u64>()? * scale)
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Network interface to use (defaults to the first non-loopback one)
    #[arg(short, long, global = true, default_value = "")]
    pub interface: String,

    /// Log verbosity
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: LevelFilter,

    /// Seconds between progress reports
    #[arg(short, long, global = true, value_parser = parse_duration, default_value = "1")]
    pub monitor_interval: Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Transmit a packet repeatedly
    Send {
        #[command(flatten)]
        packet: PacketArgs,
        #[command(flatten)]
        repeat: RepeatArgs,
    },
    /// Transmit a packet and count the replies answering it
    Sendrecv {
        #[command(flatten)]
        packet: PacketArgs,
        #[command(flatten)]
        repeat: RepeatArgs,
        #[command(flatten)]
        receive: ReceiveArgs,
    },
    /// Send ICMP echo requests to a host
    Ping {
        /// Address to ping
        #[arg(short, long)]
        target: Ipv4Addr,

        /// Next-hop MAC address
        #[arg(short = 'G', long, default_value = "ff:ff:ff:ff:ff:ff")]
        gw_mac: MacAddress,

        #[command(flatten)]
        repeat: RepeatArgs,
        #[command(flatten)]
        receive: ReceiveArgs,
    },
    /// Capture frames until stopped or a bound is reached
    Sniff {
        /// Stop after this many frames
        #[arg(long)]
        stop_count: Option<u64>,

        /// Stop after this many seconds of traffic
        #[arg(long, value_parser = parse_duration)]
        stop_time: Option<Duration>,

        /// Stop after this many bytes (supports suffixes G, M and K)
        #[arg(long, value_parser = parse_size)]
        stop_size: Option<u64>,

        /// Capture filter: a pcap expression (compiled with tcpdump) or
        /// `tcpdump -ddd` bytecode
        #[arg(short, long)]
        filter: Option<String>,

        /// Save the capture here (gzip-compressed if it ends in .gz)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List network interfaces
    Interfaces,
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct PacketArgs {
    /// Frame to send, as hex bytes starting at the Ethernet header
    #[arg(long)]
    pub hex: Option<String>,

    /// Send the first frame of this capture file
    #[arg(long)]
    pub pcap: Option<PathBuf>,
}

impl PacketArgs {
    pub fn packet(&self) -> Result<MetaPacket> {
        if let Some(hex) = &self.hex {
            return MetaPacket::from_hex(hex);
        }
        let path = self
            .pcap
            .as_deref()
            .ok_or_else(|| Error::packet("no packet given"))?;
        pcap::load(path)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::capture(format!("{} holds no packets", path.display())))
    }
}

#[derive(Args, Debug, Clone)]
pub struct RepeatArgs {
    /// Number of packets to send
    #[arg(short, long, default_value_t = 1)]
    pub count: u64,

    /// Seconds between two packets
    #[arg(long, value_parser = parse_duration, default_value = "0")]
    pub inter: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveArgs {
    /// How long to keep receiving after the last packet was sent
    #[arg(long, value_parser = parse_duration, default_value = "2")]
    pub cooldown: Duration,

    /// Receive timeout slice in milliseconds
    #[arg(long = "poll-ms", value_parser = parse_millis, default_value = "50")]
    pub poll_granularity: Duration,

    /// Poll with short timeouts even where blocking waits are supported
    #[arg(long)]
    pub force_polling: bool,
}

impl Config {
    /// Fill in the defaults that depend on the host.
    pub fn resolve(mut self) -> Result<Self> {
        if self.interface.is_empty() && !matches!(self.command, Command::Interfaces) {
            self.interface = net::default_interface()?;
        }
        Ok(self)
    }
}

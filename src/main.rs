use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};
use rand::Rng;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use pktops::capture::StaticContext;
use pktops::config::{Command, Config, ReceiveArgs, RepeatArgs};
use pktops::context::Operation;
use pktops::error::{Error, Result};
use pktops::monitor::Monitor;
use pktops::net::{self, BpfProgram, MacAddress, RawEthSocket, Transport};
use pktops::packet::MetaPacket;
use pktops::send::SendContext;
use pktops::sendrecv::SendReceiveContext;
use pktops::sniff::{SniffContext, StopConditions};
use pktops::state::State;
use pktops::worker::Worker;

fn main() -> ExitCode {
    let config = Config::parse();

    env_logger::builder()
        .filter_level(config.log_level)
        .format_target(false)
        .init();

    match config.resolve().and_then(run) {
        Ok(State::Error) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<State> {
    debug!("{:?}", config);
    let interval = config.monitor_interval;
    let iface = config.interface;

    match config.command {
        Command::Interfaces => {
            for dev in net::find_all_devs()? {
                println!("{}\t{}\t{}", dev.name, dev.hw, dev.ip);
            }
            Ok(State::NotRunning)
        }
        Command::Send { packet, repeat } => {
            let packet = packet.packet()?;
            info!("Packet: {}", packet.summary());
            let transport: Arc<dyn Transport> = Arc::new(RawEthSocket::open(&iface)?);
            let mut ctx = SendContext::new(packet, repeat.count, repeat.inter, transport)
                .with_callback(|packet| {
                    if let Some(packet) = packet {
                        debug!("Sent {}", packet.summary());
                    }
                    false
                });
            drive(&mut ctx, interval)
        }
        Command::Sendrecv {
            packet,
            repeat,
            receive,
        } => send_receive(packet.packet()?, &iface, &repeat, &receive, interval),
        Command::Ping {
            target,
            gw_mac,
            repeat,
            receive,
        } => {
            let packet = echo_request(&iface, target, gw_mac)?;
            send_receive(packet, &iface, &repeat, &receive, interval)
        }
        Command::Sniff {
            stop_count,
            stop_time,
            stop_size,
            filter,
            output,
        } => {
            let stop = StopConditions {
                count: stop_count,
                time: stop_time,
                size: stop_size,
            };
            let mut ctx = SniffContext::new(iface, stop).with_callback(|packet| {
                if let Some(packet) = packet {
                    debug!("{}", packet.summary());
                }
                false
            });
            if let Some(filter) = filter {
                ctx = ctx.with_filter(BpfProgram::from_filter(&filter)?);
            }
            let state = drive(&mut ctx, interval)?;

            if let Some(path) = output {
                let mut file = StaticContext::new(Some(path));
                file.set_data(ctx.data());
                if !file.save() {
                    return Err(Error::capture(file.summary().to_owned()));
                }
                info!("{}", file.summary());
            }
            Ok(state)
        }
    }
}

fn echo_request(iface: &str, target: Ipv4Addr, gw_mac: MacAddress) -> Result<MetaPacket> {
    let source_mac = net::get_interface_mac(iface)?;
    let source_ip = net::get_interface_ip(iface)
        .ok_or_else(|| Error::packet(format!("{} has no IPv4 address", iface)))?;
    let id = rand::thread_rng().gen();
    MetaPacket::icmp_echo(source_mac, gw_mac, source_ip, target, id, 1)
}

fn send_receive(
    packet: MetaPacket,
    iface: &str,
    repeat: &RepeatArgs,
    receive: &ReceiveArgs,
    interval: Duration,
) -> Result<State> {
    info!("Probe: {}", packet.summary());
    // The probes we transmit would otherwise be read back as traffic
    let transport: Arc<dyn Transport> = Arc::new(RawEthSocket::open(iface)?.ignore_outgoing(true));
    let mut ctx = SendReceiveContext::new(packet, repeat.count, repeat.inter, transport)
        .with_cooldown(receive.cooldown)
        .with_poll_granularity(receive.poll_granularity)
        .force_polling(receive.force_polling)
        .on_recv(|packet, is_reply| {
            match packet {
                Some(packet) if is_reply => info!("Reply: {}", packet.summary()),
                Some(packet) => debug!("Unrelated: {}", packet.summary()),
                None => {}
            }
            false
        });

    let state = drive(&mut ctx, interval)?;
    let stats = ctx.stats();
    info!(
        "sent {}, answered {}, unrelated {}, learned {} binding(s)",
        stats.count,
        stats.answers,
        stats.received,
        ctx.cache().len()
    );
    Ok(state)
}

/// Run `op` to completion, stopping it early on SIGINT or SIGTERM.
fn drive(op: &mut dyn Operation, interval: Duration) -> Result<State> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    let signals_handle = signals.handle();
    let stopper = op.lifecycle().stop_handle();

    if !op.start() {
        error!("Could not start: {}", op.summary());
        return Ok(State::Error);
    }

    let listener = Worker::spawn("signals", move || {
        if let Some(signal) = signals.forever().next() {
            info!("Caught signal {}, stopping", signal);
            stopper.stop();
        }
    });
    if let Err(e) = &listener {
        warn!("{}; interrupting will not save partial results", e);
    }

    Monitor::new(interval).watch(op);
    signals_handle.close();
    if let Ok(mut listener) = listener {
        listener.join();
    }
    Ok(op.state())
}

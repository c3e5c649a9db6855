//! CLI client for the control protocol of §6: encodes one admin command as a
//! UDP datagram and fires it at a running daemon.

use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;

use workshopd::control::udp::{encode_datagram, Command as WireCommand};

#[derive(Parser)]
#[command(name = "workshop-control", version)]
#[command(about = "Send an admin command to a running workshopd")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Address of the daemon's control UDP listener.
    #[arg(short, long, default_value = "127.0.0.1:5484")]
    server: String,
}

#[derive(Subcommand)]
enum Command {
    /// No-op; checks that the daemon is reachable.
    Nop,
    /// Sets the log verbosity level.
    Verbose {
        level: u8,
    },
    /// Stops claiming new workshop jobs.
    DisableQueue,
    /// Resumes claiming new workshop jobs.
    EnableQueue,
    /// Sends SIGTERM to every running child tagged with the given value.
    TerminateChildren {
        tag: String,
    },
}

impl From<Command> for WireCommand {
    fn from(command: Command) -> Self {
        match command {
            Command::Nop => WireCommand::Nop,
            Command::Verbose { level } => WireCommand::Verbose(level),
            Command::DisableQueue => WireCommand::DisableQueue,
            Command::EnableQueue => WireCommand::EnableQueue,
            Command::TerminateChildren { tag } => WireCommand::TerminateChildren(tag),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&cli.server).await?;

    let datagram = encode_datagram(&cli.command.into());
    socket.send(&datagram).await?;

    println!("sent to {}", cli.server);
    Ok(())
}

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{config::DEFAULT_LISTEN_ADDR, worker::ExitPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting encrypted chat clients over TCP.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: SocketAddr,

    /// Size of the single read that carries one message.
    #[arg(long, default_value_t = crate::frame::DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Seconds a new client has to finish the key exchange.
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Whether `exit` closes the session right away or waits for the client.
    #[arg(long, value_enum, default_value_t = ExitPolicy::AwaitClose)]
    pub exit_policy: ExitPolicy,

    #[arg(long, default_value_t = 5)]
    pub public_exponent: u64,

    #[arg(long, default_value_t = 173)]
    pub private_exponent: u64,

    #[arg(long, default_value_t = 323)]
    pub modulus: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// User id other clients address messages to.
    #[arg(long)]
    pub user: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub server: SocketAddr,

    #[arg(long, default_value_t = 7)]
    pub public_exponent: u64,

    #[arg(long, default_value_t = 151)]
    pub private_exponent: u64,

    #[arg(long, default_value_t = 299)]
    pub modulus: u64,
}

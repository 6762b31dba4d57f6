use std::{net::SocketAddr, time::Duration};

use crate::{
    cipher::KeyPair,
    cli::ServeArgs,
    frame::DEFAULT_BUFFER_SIZE,
    worker::ExitPolicy,
};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Runtime settings for the relay.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub keys: KeyPair,
    /// Bytes accepted by a single read, which is also the largest message.
    pub buffer_size: usize,
    /// Upper bound on a handshake. Handshakes run inline on the accept loop.
    pub handshake_timeout: Duration,
    pub exit_policy: ExitPolicy,
    /// How long shutdown waits for workers before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            keys: KeyPair::SERVER_DEFAULT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            exit_policy: ExitPolicy::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl From<&ServeArgs> for ServerConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            listen: args.listen,
            keys: KeyPair::new(args.public_exponent, args.private_exponent, args.modulus),
            buffer_size: args.buffer_size.max(1),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs.max(1)),
            exit_policy: args.exit_policy,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Command};

    #[test]
    fn serve_defaults_match_config_defaults() {
        let cli = Cli::parse_from(["secure_chat_relay", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        let config = ServerConfig::from(&args);
        let defaults = ServerConfig::default();
        assert_eq!(config.listen, defaults.listen);
        assert_eq!(config.keys, defaults.keys);
        assert_eq!(config.buffer_size, defaults.buffer_size);
        assert_eq!(config.handshake_timeout, defaults.handshake_timeout);
        assert_eq!(config.exit_policy, ExitPolicy::AwaitClose);
    }

    #[test]
    fn exit_policy_is_selectable() {
        let cli = Cli::parse_from([
            "secure_chat_relay",
            "serve",
            "--exit-policy",
            "close-immediately",
            "--buffer-size",
            "0",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        let config = ServerConfig::from(&args);
        assert_eq!(config.exit_policy, ExitPolicy::CloseImmediately);
        assert_eq!(config.buffer_size, 1);
    }

    #[test]
    fn zero_handshake_timeout_is_raised_to_one_second() {
        let cli = Cli::parse_from([
            "secure_chat_relay",
            "serve",
            "--handshake-timeout-secs",
            "0",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        let config = ServerConfig::from(&args);
        assert_eq!(config.handshake_timeout, Duration::from_secs(1));
    }
}

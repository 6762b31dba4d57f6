use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    cipher::{self, Cipher},
    error::SessionError,
    registry::{ConnectionState, SessionRegistry},
};

pub const EXIT_COMMAND: &str = "exit";

/// What a decrypted message asks the relay to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive<'a> {
    Empty,
    Exit,
    Direct { recipient: &'a str, body: &'a str },
    Broadcast(&'a str),
}

impl<'a> Directive<'a> {
    pub fn parse(plaintext: &'a str) -> Self {
        if plaintext.trim().is_empty() {
            return Directive::Empty;
        }
        if plaintext == EXIT_COMMAND {
            return Directive::Exit;
        }
        match plaintext.split_once('/') {
            Some((recipient, body)) => Directive::Direct {
                recipient: recipient.trim(),
                body,
            },
            None => Directive::Broadcast(plaintext),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Continue,
    /// The sender asked to end its session.
    Exit,
}

/// Forwards direct messages between sessions.
#[derive(Clone)]
pub struct Router {
    registry: Arc<SessionRegistry>,
    cipher: Arc<dyn Cipher>,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, cipher: Arc<dyn Cipher>) -> Self {
        Self { registry, cipher }
    }

    pub async fn dispatch(&self, sender: &ConnectionState, plaintext: &str) -> RouteOutcome {
        let sender_name = sender.display_name();

        match Directive::parse(plaintext) {
            Directive::Empty => {
                info!(id = sender.id, user = %sender_name, "(empty message)");
                RouteOutcome::Continue
            }
            Directive::Exit => {
                info!(id = sender.id, user = %sender_name, "client sent exit command");
                RouteOutcome::Exit
            }
            Directive::Direct { recipient, body } => {
                info!(from = %sender_name, to = %recipient, %body, "direct message");
                match self.forward(&sender_name, recipient, body).await {
                    Ok(()) => info!(from = %sender_name, to = %recipient, "message forwarded"),
                    Err(err) => {
                        warn!(from = %sender_name, to = %recipient, error = %err, "delivery failed");
                        self.report_failure(sender, recipient, &err).await;
                    }
                }
                RouteOutcome::Continue
            }
            Directive::Broadcast(text) => {
                info!(user = %sender_name, %text, "broadcast not implemented; message dropped");
                RouteOutcome::Continue
            }
        }
    }

    async fn forward(&self, sender: &str, recipient: &str, body: &str) -> Result<(), SessionError> {
        let target = self
            .registry
            .find(recipient)
            .await
            .ok_or_else(|| SessionError::NotFound(recipient.to_string()))?;
        let key = target
            .state
            .public_key
            .ok_or_else(|| SessionError::NotFound(recipient.to_string()))?;

        let message = format!("[DM from {sender}]: {body}");
        let frame = cipher::serialize(&self.cipher.encrypt(&message, &key));
        target.outbound.send(&frame).await?;
        Ok(())
    }

    /// Tells the sender, under its own key, that its message went nowhere.
    async fn report_failure(&self, sender: &ConnectionState, recipient: &str, err: &SessionError) {
        let notice = match err {
            SessionError::NotFound(_) => {
                format!("Error: User '{recipient}' not found or not connected.")
            }
            _ => format!(
                "Error: Failed to deliver message to '{recipient}'. They may have disconnected."
            ),
        };

        // Liveness is only trustworthy when read through the registry.
        let Some(current) = self.registry.get(sender.id).await else {
            warn!(id = sender.id, "cannot report delivery failure: sender is gone");
            return;
        };
        let key = match current.state.public_key {
            Some(key) if current.state.connected => key,
            _ => {
                warn!(id = sender.id, "cannot report delivery failure: sender not connected");
                return;
            }
        };

        let frame = cipher::serialize(&self.cipher.encrypt(&notice, &key));
        if let Err(send_err) = current.outbound.send(&frame).await {
            warn!(id = sender.id, error = ?send_err, "failed to send error reply");
        }
    }
}

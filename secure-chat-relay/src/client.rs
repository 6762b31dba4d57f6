use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cipher::{self, Cipher, KeyPair, PublicKey, ToyRsa},
    cli::ConnectArgs,
    frame::{DEFAULT_BUFFER_SIZE, read_frame, write_frame},
    handshake,
    router::EXIT_COMMAND,
};

/// Client end of a relay connection, after the key exchange.
pub struct Client {
    inbox: Inbox,
    outbox: Outbox,
}

/// Receiving half: decrypts frames with the client's private key.
pub struct Inbox {
    reader: OwnedReadHalf,
    keys: KeyPair,
    buf: Vec<u8>,
}

/// Sending half: encrypts under the relay's public key.
pub struct Outbox {
    writer: OwnedWriteHalf,
    server_key: PublicKey,
}

impl Client {
    /// Connects and performs the client side of the key exchange.
    ///
    /// The relay does not acknowledge the exchange. A rejected user id shows
    /// up as a plaintext notice on the first [`Inbox::recv`], followed by
    /// end-of-stream.
    pub async fn connect(addr: SocketAddr, user_id: &str, keys: KeyPair) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (mut reader, mut writer) = stream.into_split();

        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        let Some(frame) = read_frame(&mut reader, &mut buf).await? else {
            bail!("relay closed the connection before sending its key");
        };
        let server_key =
            handshake::parse_public_key(&frame).context("relay sent an unusable public key")?;

        write_frame(&mut writer, &format!("{} {user_id}", keys.public)).await?;

        Ok(Self {
            inbox: Inbox {
                reader,
                keys,
                buf,
            },
            outbox: Outbox { writer, server_key },
        })
    }

    pub fn server_key(&self) -> PublicKey {
        self.outbox.server_key
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.outbox.send_text(text).await
    }

    pub async fn send_raw(&mut self, frame: &str) -> Result<()> {
        self.outbox.send_raw(frame).await
    }

    pub async fn recv(&mut self) -> Result<Option<String>> {
        self.inbox.recv().await
    }

    pub async fn recv_raw(&mut self) -> Result<Option<String>> {
        self.inbox.recv_raw().await
    }

    pub fn into_split(self) -> (Inbox, Outbox) {
        (self.inbox, self.outbox)
    }

    pub async fn close(self) -> Result<()> {
        let (_, mut outbox) = self.into_split();
        outbox.close().await
    }
}

impl Inbox {
    /// Next message as text. Frames that are not ciphertext, such as the
    /// relay's plaintext notices, are returned verbatim.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let Some(frame) = self.recv_raw().await? else {
            return Ok(None);
        };

        let ciphertext = cipher::deserialize(&frame);
        if ciphertext.is_empty() {
            return Ok(Some(frame));
        }
        Ok(Some(ToyRsa.decrypt(&ciphertext, &self.keys.private)))
    }

    pub async fn recv_raw(&mut self) -> Result<Option<String>> {
        Ok(read_frame(&mut self.reader, &mut self.buf).await?)
    }
}

impl Outbox {
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        let frame = cipher::serialize(&ToyRsa.encrypt(text, &self.server_key));
        self.send_raw(&frame).await
    }

    pub async fn send_raw(&mut self, frame: &str) -> Result<()> {
        write_frame(&mut self.writer, frame)
            .await
            .context("failed to send frame to relay")
    }

    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("failed to close connection")
    }
}

/// Interactive terminal session.
pub async fn run(args: ConnectArgs) -> Result<()> {
    let keys = KeyPair::new(args.public_exponent, args.private_exponent, args.modulus);
    let client = Client::connect(args.server, &args.user, keys).await?;
    info!(server = %args.server, key = %client.server_key(), "connected to relay");
    write_stdout(&format!(
        "*** connected as {}; send messages as <user>/<text>, 'exit' to leave",
        args.user
    ))
    .await?;

    let (mut inbox, mut outbox) = client.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut inbox, &mut outbox, &mut stdin, &mut input).await?;
    if let Err(error) = outbox.close().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }

    Ok(())
}

async fn run_client_loop(
    inbox: &mut Inbox,
    outbox: &mut Outbox,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            message = inbox.recv() => {
                if !handle_relay_message(message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, outbox).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relay_message(message: Result<Option<String>>) -> Result<bool> {
    match message? {
        Some(text) => {
            write_stdout(&text).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    outbox: &mut Outbox,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return Ok(true);
    }

    outbox.send_text(text).await?;
    if text == EXIT_COMMAND {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

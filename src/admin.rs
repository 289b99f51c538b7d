//! Admin channel client (C5): a line-oriented TCP client for the device's
//! administration port, used to list, rewrite, and query telemetry
//! destinations ("UDPC streams").

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::AdminError;

/// One row of `list`'s tabular output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpcStream {
    pub id: u32,
    pub stream_type: String,
    pub destination: String,
}

/// A single-use session against the device's admin port: open, run
/// operations, close. There is no connection pool — each [`AdminClient::open`]
/// dials a fresh TCP connection, mirroring the original's telnet client.
pub struct AdminClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    op_timeout: Duration,
}

const PROMPT: &[u8] = b">";

impl AdminClient {
    /// Connects to `addr` and reads up to the first `>` prompt.
    pub async fn open(addr: SocketAddr, op_timeout: Duration) -> Result<Self, AdminError> {
        let stream = timeout(op_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AdminError::Timeout)?
            .map_err(|source| AdminError::Connect(addr, source))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            op_timeout,
        };
        client.read_until(PROMPT).await?;
        debug!(%addr, "admin channel opened");
        Ok(client)
    }

    async fn read_until(&mut self, pattern: &[u8]) -> Result<Vec<u8>, AdminError> {
        let mut buf = Vec::new();
        let fut = async {
            let mut byte = [0u8; 1];
            loop {
                let n = self
                    .reader
                    .read(&mut byte)
                    .await
                    .map_err(AdminError::Io)?;
                if n == 0 {
                    return Err(AdminError::ConnectionReset);
                }
                buf.push(byte[0]);
                if buf.len() >= pattern.len() && buf[buf.len() - pattern.len()..] == *pattern {
                    return Ok(buf.clone());
                }
            }
        };
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| AdminError::Timeout)?
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), AdminError> {
        timeout(self.op_timeout, async {
            self.writer.write_all(data).await.map_err(AdminError::Io)?;
            self.writer.flush().await.map_err(AdminError::Io)
        })
        .await
        .map_err(|_| AdminError::Timeout)?
    }

    /// Resynchronizes on the prompt before issuing `command`, per §4.5's wire
    /// detail: write a bare newline, read to `>`, then write the real command
    /// and read back its echo before reading the response.
    async fn run_command(&mut self, command: &[u8]) -> Result<Vec<u8>, AdminError> {
        self.write_all(b"\n").await?;
        self.read_until(PROMPT).await?;
        self.write_all(command).await?;
        self.read_until(command).await?;
        self.read_until(PROMPT).await
    }

    /// `list` — returns every row whose type column is `UDPC`.
    pub async fn list_streams(&mut self) -> Result<Vec<UdpcStream>, AdminError> {
        let raw = self.run_command(b"list\n").await?;
        let text = String::from_utf8_lossy(&raw);
        let mut streams = Vec::new();
        // Rows are fixed-width columns ("# id  TYPE  dest"); split on a literal
        // space (not split_whitespace) so the column padding keeps dest at a
        // stable index, matching the original telnet client's `line.split(" ")`.
        for line in text.lines().skip(1) {
            let parts: Vec<&str> = line.split(' ').collect();
            if parts.len() >= 5 && parts[2] == "UDPC" {
                if let Ok(id) = parts[1].parse::<u32>() {
                    streams.push(UdpcStream {
                        id,
                        stream_type: parts[2].to_string(),
                        destination: parts[4].to_string(),
                    });
                }
            }
        }
        Ok(streams)
    }

    pub async fn get_variable(&mut self, name: &str) -> Result<String, AdminError> {
        let command = format!("get {name}\r\n");
        let raw = self.run_command(command.as_bytes()).await?;
        Ok(String::from_utf8_lossy(&raw).trim_end_matches('>').trim().to_string())
    }

    pub async fn get_all_variables(&mut self) -> Result<Vec<(String, String)>, AdminError> {
        let raw = self.run_command(b"get all\r\n").await?;
        let text = String::from_utf8_lossy(&raw);
        let mut pairs = Vec::new();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(": ") {
                pairs.push((key.to_string(), value.trim_end_matches('>').trim().to_string()));
            }
        }
        Ok(pairs)
    }

    pub async fn close_stream(&mut self, id: u32) -> Result<(), AdminError> {
        let command = format!("stream_close {id}\n");
        self.run_command(command.as_bytes()).await?;
        Ok(())
    }

    pub async fn set_udpc(&mut self, host: &str, port: u16) -> Result<(), AdminError> {
        let command = format!("udpc {host} {port}\n");
        self.run_command(command.as_bytes()).await?;
        Ok(())
    }

    /// Issues the admin `save` command. Unsafe per §9: it wears flash on the
    /// device. The destination updater (C6) deliberately never calls this.
    pub async fn save(&mut self) -> Result<(), AdminError> {
        self.run_command(b"save\n").await?;
        Ok(())
    }
}

//! Shared I/O helpers for the fake servers.
//!
//! Writes flush eagerly so every reply leaves the server in the order
//! the test expects. Every line a client sends is appended to a shared
//! wire log together with the transport it arrived on.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// One client line as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireLine {
    /// Whether the line arrived over TLS.
    pub encrypted: bool,
    pub line: String,
}

/// Lines received by a fake server, across all connections.
#[derive(Debug, Clone, Default)]
pub struct WireLog(Arc<Mutex<Vec<WireLine>>>);

impl WireLog {
    pub fn push(&self, encrypted: bool, line: &str) {
        self.0.lock().unwrap().push(WireLine {
            encrypted,
            line: line.trim_end_matches(['\r', '\n']).to_string(),
        });
    }

    pub fn lines(&self) -> Vec<WireLine> {
        self.0.lock().unwrap().clone()
    }
}

/// Write a string to the stream and flush.
pub async fn write_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &str,
) -> std::io::Result<()> {
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().flush().await
}

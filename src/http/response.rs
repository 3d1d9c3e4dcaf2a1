//! Minimal HTTP/1.1 response writer
//!
//! Collects headers and emits the status line + headers exactly once, on
//! the first `write_header` or `write` call. Later `write_header` calls
//! are ignored. Used for error responses (503) on the raw client
//! connection.

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write-once response head over a raw connection
pub struct ResponseWriter<'a, S> {
    conn: &'a mut S,
    headers: Vec<(String, String)>,
    written: bool,
}

impl<'a, S: AsyncWrite + Unpin> ResponseWriter<'a, S> {
    /// Wrap a connection for writing one response.
    pub fn new(conn: &'a mut S) -> Self {
        ResponseWriter {
            conn,
            headers: Vec::new(),
            written: false,
        }
    }

    /// Add a header; must be called before the head is emitted.
    pub fn insert_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Emit `HTTP/1.1 <code> <reason>` and the collected headers.
    ///
    /// Only the first call writes; the rest are ignored.
    pub async fn write_header(&mut self, status: u16) -> io::Result<()> {
        if self.written {
            return Ok(());
        }
        self.written = true;

        let mut head = match status_text(status) {
            Some(reason) => format!("HTTP/1.1 {} {}\r\n", status, reason),
            None => format!("HTTP/1.1 {} status code {}\r\n", status, status),
        };
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        self.conn.write_all(head.as_bytes()).await?;
        self.conn.flush().await
    }

    /// Write body bytes, emitting a 200 head first if none was written.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.written {
            self.write_header(200).await?;
        }
        self.conn.write_all(data).await?;
        self.conn.flush().await
    }
}

fn status_text(status: u16) -> Option<&'static str> {
    match status {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        404 => Some("Not Found"),
        500 => Some("Internal Server Error"),
        502 => Some("Bad Gateway"),
        503 => Some("Service Unavailable"),
        504 => Some("Gateway Timeout"),
        _ => None,
    }
}

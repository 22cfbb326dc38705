// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Child output relay.
//!
//! llama-server redraws progress with bare carriage returns, so both `\r`
//! and `\n` end a line here. Each line is logged under the `llama-server`
//! target; filter it with e.g. `RUST_LOG=llama-server=off`.

use std::io::Read;
use std::thread::{self, JoinHandle};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Target used for relayed child output.
pub const RELAY_TARGET: &str = "llama-server";

const READ_CHUNK: usize = 8 * 1024;

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Incremental byte → line splitter.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them. Empty lines are dropped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Whatever remains after the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

fn emit(stream: OutputStream, line: &str) {
    tracing::info!(target: RELAY_TARGET, stream = stream.as_str(), "{}", line);
}

/// Relay a blocking reader on its own thread until EOF.
pub fn spawn_relay<R>(reader: R, stream: OutputStream) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("llama-server-{}", stream.as_str()))
        .spawn(move || relay_blocking(reader, stream))
}

fn relay_blocking<R: Read>(mut reader: R, stream: OutputStream) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    emit(stream, &line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(stream = stream.as_str(), error = %e, "Output relay stopped");
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        emit(stream, &line);
    }
}

/// Relay an async reader until EOF. Spawn it as a task.
pub async fn relay_async<R>(mut reader: R, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    emit(stream, &line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(stream = stream.as_str(), error = %e, "Output relay stopped");
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        emit(stream, &line);
    }
}

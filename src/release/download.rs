// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Archive download.
//!
//! Downloads stream into a caller-chosen file. A transfer is only reported
//! as successful when the number of bytes written equals the advertised
//! `Content-Length` (if the server sent one), so a truncated archive never
//! reaches the extractor.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{Result, WardenError};

use super::index::USER_AGENT;

/// Connect timeout for archive downloads.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Whole-transfer timeout. Release archives run to a few hundred MB.
const TRANSFER_TIMEOUT_SECS: u64 = 30 * 60;

const CHUNK_SIZE: usize = 64 * 1024;

/// Something that can put the bytes behind a URL into a file.
pub trait ArchiveDownloader: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Blocking HTTP(S) downloader with an optional terminal progress bar.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    show_progress: bool,
    transfer_timeout: Duration,
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            show_progress: false,
            transfer_timeout: Duration::from_secs(TRANSFER_TIMEOUT_SECS),
        }
    }

    /// Draw a progress bar on stderr while downloading.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    fn progress_bar(&self, total: Option<u64>, name: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = match total {
            Some(len) => {
                let pb = ProgressBar::new(len);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("█▓░"),
                );
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("  {spinner:.cyan} {bytes} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb
            }
        };
        pb.set_message(name.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

impl ArchiveDownloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        tracing::info!(url, dest = %dest.display(), "Downloading archive");

        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(self.transfer_timeout)
            .build()
            .map_err(|e| WardenError::download(url, e))?;

        let mut response = client
            .get(url)
            .send()
            .map_err(|e| WardenError::download(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WardenError::download(url, format!("HTTP {status}")));
        }

        let expected = response.content_length();
        let name = url.rsplit('/').next().unwrap_or(url);
        let pb = self.progress_bar(expected, name);

        let file = File::create(dest)
            .map_err(|e| WardenError::io(format!("creating {}", dest.display()), e))?;
        let mut writer = BufWriter::new(file);
        let written = copy_with_progress(&mut response, &mut writer, &pb)
            .map_err(|e| WardenError::download(url, format!("transfer interrupted: {e}")))?;
        writer
            .flush()
            .map_err(|e| WardenError::io(format!("writing {}", dest.display()), e))?;
        pb.finish_and_clear();

        verify_length(url, expected, written)?;
        tracing::debug!(url, bytes = written, "Download complete");
        Ok(written)
    }
}

fn copy_with_progress<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    pb: &ProgressBar,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
        pb.set_position(total);
    }
}

/// Fail when the server advertised a length and we received something else.
pub(crate) fn verify_length(url: &str, expected: Option<u64>, written: u64) -> Result<()> {
    match expected {
        Some(len) if len != written => Err(WardenError::download(
            url,
            format!("incomplete download: expected {len} bytes, got {written}"),
        )),
        _ => Ok(()),
    }
}

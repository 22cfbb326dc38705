// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fakes for the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use llama_warden::release::{
    ArchiveDownloader, ReleaseAsset, ReleaseIndex, ReleaseManager, ReleasesDir,
};
use llama_warden::{Arch, HostPlatform, OsFamily, Result, WardenError};

pub const LINUX_X64: HostPlatform = HostPlatform {
    os: OsFamily::Linux,
    arch: Arch::X64,
};

// =============================================================================
// RELEASE INDEX
// =============================================================================

#[derive(Default)]
pub struct FakeIndex {
    pub latest: String,
    pub releases: HashMap<String, Vec<ReleaseAsset>>,
    pub latest_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl FakeIndex {
    pub fn new(latest: &str) -> Self {
        Self {
            latest: latest.to_string(),
            ..Default::default()
        }
    }

    pub fn with_release(mut self, tag: &str, assets: Vec<ReleaseAsset>) -> Self {
        self.releases.insert(tag.to_string(), assets);
        self
    }

    pub fn calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst) + self.list_calls.load(Ordering::SeqCst)
    }
}

impl ReleaseIndex for FakeIndex {
    fn latest_tag(&self) -> Result<String> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.latest.clone())
    }

    fn list_assets(&self, tag: &str) -> Result<Vec<ReleaseAsset>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.releases
            .get(tag)
            .cloned()
            .ok_or_else(|| WardenError::download(format!("fake://releases/{tag}"), "HTTP 404 Not Found"))
    }
}

// =============================================================================
// DOWNLOADER
// =============================================================================

#[derive(Default)]
pub struct FakeDownloader {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub downloads: AtomicUsize,
}

impl FakeDownloader {
    pub fn serve(self, url: &str, bytes: Vec<u8>) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes);
        self
    }

    pub fn count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl ArchiveDownloader for FakeDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let bytes = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| WardenError::download(url, "HTTP 404 Not Found"))?;
        fs::write(dest, &bytes).map_err(|e| WardenError::io("writing fake download", e))?;
        Ok(bytes.len() as u64)
    }
}

pub fn manager(
    releases: &Path,
    index: &Arc<FakeIndex>,
    downloader: &Arc<FakeDownloader>,
) -> ReleaseManager {
    ReleaseManager::with_sources(
        ReleasesDir::at(releases),
        Arc::clone(index) as Arc<dyn ReleaseIndex>,
        Arc::clone(downloader) as Arc<dyn ArchiveDownloader>,
    )
    .with_platform(LINUX_X64)
}

// =============================================================================
// ARCHIVES
// =============================================================================

pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn tar_gz_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn asset(name: &str) -> ReleaseAsset {
    ReleaseAsset::new(name, format!("https://example.com/download/{name}"))
}

// =============================================================================
// STAND-IN SERVER
// =============================================================================

/// Write an executable `llama-server` shell script into `dir`.
#[cfg(unix)]
pub fn stand_in_server(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    fs::create_dir_all(dir).unwrap();
    let path = dir.join("llama-server");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Whether a process with `pid` still exists (zombies included).
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

// =============================================================================
// READINESS
// =============================================================================

/// Ready once the stand-in server has written `marker`.
pub struct MarkerProbe {
    pub marker: PathBuf,
    pub probes: AtomicUsize,
}

impl MarkerProbe {
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: marker.into(),
            probes: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.marker.is_file()
    }
}

impl llama_warden::process::ReadinessProbe for MarkerProbe {
    fn probe(&self, _endpoint: &llama_warden::ServerEndpoint) -> bool {
        self.check()
    }
}

#[async_trait::async_trait]
impl llama_warden::process::AsyncReadinessProbe for MarkerProbe {
    async fn probe(&self, _endpoint: &llama_warden::ServerEndpoint) -> bool {
        self.check()
    }
}

/// Short timings, a fixed port and an isolated cache; no release source yet.
pub fn quick_options(releases: &Path) -> llama_warden::ServerOptions {
    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
    llama_warden::ServerOptions::new()
        .environment(llama_warden::EnvSnapshot::from_pairs([("PATH", path)]))
        .releases_dir(releases)
        .port(18181)
        .start_timeout(std::time::Duration::from_secs(10))
        .poll_interval(std::time::Duration::from_millis(50))
        .stop_grace(std::time::Duration::from_millis(500))
}

/// Options pointing at a local stand-in binary.
pub fn local_options(bin_dir: &Path, releases: &Path) -> llama_warden::ServerOptions {
    quick_options(releases).binary_dir(bin_dir)
}

/// Options resolving `url` through fakes that serve a tar.gz holding a
/// stand-in server running `body` under `llama-b1/`.
///
/// Returns the marker path the stand-in writes once extracted and started.
pub fn archive_options(
    url: &str,
    body: &str,
    releases: &Path,
    index: &Arc<FakeIndex>,
    downloader: FakeDownloader,
) -> (llama_warden::ServerOptions, Arc<FakeDownloader>, PathBuf) {
    let script = format!("#!/bin/sh\n{body}\n");
    let downloader = Arc::new(
        downloader.serve(url, tar_gz_archive(&[("llama-b1/llama-server", script.as_bytes())])),
    );
    let marker = ReleasesDir::at(releases)
        .entry_for_url(url)
        .path()
        .join("llama-b1")
        .join("ready");
    let options = quick_options(releases)
        .archive_url(url)
        .release_index(Arc::clone(index) as Arc<dyn ReleaseIndex>)
        .downloader(Arc::clone(&downloader) as Arc<dyn ArchiveDownloader>);
    (options, downloader, marker)
}

/// Send SIGKILL to `pid`.
#[cfg(unix)]
pub fn kill_hard(pid: u32) {
    std::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status()
        .unwrap();
}

/// Script body: write the marker (with env and args), then keep running.
pub const READY_THEN_SLEEP: &str =
    "echo \"$LLAMA_ARG_PORT $LLAMA_ARG_CTX_SIZE $*\" > ready.tmp\nmv ready.tmp ready\nexec sleep 30";

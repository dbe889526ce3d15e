//! Terminal scan station. A USB QR scanner in keyboard-wedge mode types the
//! decoded payload and a newline, so reading stdin lines stands in for a
//! camera decoder.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use client_core::{
    toggle_label, BannerStyle, QrDecoder, ResultBanner, ResultPanel, ScanCycleController,
};
use serde::Serialize;
use shared::protocol::LoginResponse;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::info;

const DETECTION_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Parser)]
#[command(name = "kiosk", about = "Attendance scan station")]
struct Args {
    /// Base URL of the attendance server.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,

    /// Username of the operating teacher or admin.
    #[arg(long)]
    username: String,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
}

/// Stdin-backed decoder. `offer` delivers a scanned line only while started,
/// mirroring a camera that produces no frames while stopped.
struct LineDecoder {
    running: AtomicBool,
    detections: broadcast::Sender<String>,
}

impl LineDecoder {
    fn new() -> Self {
        let (detections, _) = broadcast::channel(DETECTION_CHANNEL_CAPACITY);
        Self {
            running: AtomicBool::new(false),
            detections,
        }
    }

    fn offer(&self, payload: &str) {
        if !self.running.load(Ordering::SeqCst) {
            info!("scanner is stopped; ignoring input");
            return;
        }
        let _ = self.detections.send(payload.to_string());
    }
}

#[async_trait]
impl QrDecoder for LineDecoder {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_detections(&self) -> broadcast::Receiver<String> {
        self.detections.subscribe()
    }
}

struct TerminalPanel;

#[async_trait]
impl ResultPanel for TerminalPanel {
    async fn show(&self, banner: ResultBanner) {
        let marker = match banner.style {
            BannerStyle::Success => "[OK]",
            BannerStyle::Danger => "[GAGAL]",
        };
        for line in banner.text.lines() {
            println!("{marker} {line}");
        }
    }

    async fn clear(&self) {
        println!("----------------------------------------");
    }
}

async fn login(server_url: &str, username: &str) -> Result<LoginResponse> {
    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/login", server_url.trim_end_matches('/')))
        .json(&LoginRequest { username })
        .send()
        .await
        .context("failed to reach server")?;
    if !response.status().is_success() {
        bail!("login rejected for '{username}' ({})", response.status());
    }
    response
        .json::<LoginResponse>()
        .await
        .context("malformed login response")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let session = login(&args.server_url, &args.username).await?;
    if !session.role.can_record_attendance() {
        bail!(
            "user '{}' has role '{}' and may not operate the scan station",
            args.username,
            session.role.as_str()
        );
    }
    info!(user_id = session.user_id.0, role = session.role.as_str(), "logged in");

    let decoder = Arc::new(LineDecoder::new());
    let panel = Arc::new(TerminalPanel);
    let controller = ScanCycleController::new(
        &args.server_url,
        session.user_id,
        Arc::clone(&decoder) as Arc<dyn QrDecoder>,
        panel,
    )?;
    controller.mount().await?;

    println!("Scan QR atau ketik payload. Perintah: /toggle, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/toggle" => {
                let running = controller.toggle_scanner().await?;
                println!("{}", toggle_label(running));
            }
            payload => decoder.offer(payload),
        }
    }

    controller.unmount().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_decoder_only_delivers_while_running() {
        let decoder = LineDecoder::new();
        let mut detections = decoder.subscribe_detections();

        decoder.offer("STUDENT:2210:1");
        assert!(detections.try_recv().is_err());

        decoder.start().await.expect("start");
        decoder.offer("STUDENT:2210:1");
        assert_eq!(detections.try_recv().ok().as_deref(), Some("STUDENT:2210:1"));

        decoder.stop().await.expect("stop");
        decoder.offer("STUDENT:2211:1");
        assert!(detections.try_recv().is_err());
    }
}

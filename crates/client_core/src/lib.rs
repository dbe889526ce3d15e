use std::{fmt::Write as _, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use shared::{domain::UserId, protocol::ScanOutcome};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};
use url::Url;

/// How long an outcome banner stays visible before the cycle clears it and
/// restarts the decoder.
pub const RESULT_DISPLAY_DELAY: Duration = Duration::from_millis(3000);
const SCAN_ENDPOINT_PATH: &str = "/teacher/scan/process";
const TRANSPORT_FAILURE_PREFIX: &str = "Terjadi kesalahan: ";
const DETECTION_BANNER_PREFIX: &str = "QR Code terdeteksi: ";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Toggle-control label while the decoder is running.
pub const TOGGLE_LABEL_RUNNING: &str = "Stop Scan";
/// Toggle-control label while the decoder is stopped.
pub const TOGGLE_LABEL_STOPPED: &str = "Mulai Scan";

pub fn toggle_label(running: bool) -> &'static str {
    if running {
        TOGGLE_LABEL_RUNNING
    } else {
        TOGGLE_LABEL_STOPPED
    }
}

/// The capture device seam: something that can be started and stopped and
/// reports decoded payload text. Implementations must not deliver detections
/// while stopped.
#[async_trait]
pub trait QrDecoder: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn subscribe_detections(&self) -> broadcast::Receiver<String>;
}

/// The result display region seam.
#[async_trait]
pub trait ResultPanel: Send + Sync {
    async fn show(&self, banner: ResultBanner);
    async fn clear(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerStyle {
    Success,
    Danger,
}

/// One rendered message for the display region. Multi-line text keeps the
/// message first, then the student name, then the status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultBanner {
    pub style: BannerStyle,
    pub text: String,
}

impl ResultBanner {
    fn detection(payload: &str) -> Self {
        Self {
            style: BannerStyle::Success,
            text: format!("{DETECTION_BANNER_PREFIX}{payload}"),
        }
    }

    fn from_outcome(outcome: &ScanOutcome) -> Self {
        if !outcome.success {
            return Self {
                style: BannerStyle::Danger,
                text: outcome.message.clone(),
            };
        }
        let mut text = outcome.message.clone();
        if let Some(name) = &outcome.student_name {
            let _ = write!(text, "\n{name}");
        }
        if let Some(status) = &outcome.status {
            let _ = write!(text, "\nStatus: {status}");
        }
        Self {
            style: BannerStyle::Success,
            text,
        }
    }

    fn transport_failure(description: &str) -> Self {
        Self {
            style: BannerStyle::Danger,
            text: format!("{TRANSPORT_FAILURE_PREFIX}{description}"),
        }
    }
}

/// Why a submission produced no `ScanOutcome`. Server-side rejections are not
/// errors; they arrive as `success: false` outcomes. HTTP status codes are
/// deliberately not consulted.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to reach server: {0}")]
    Send(#[source] reqwest::Error),
    #[error("response was not valid JSON: {0}")]
    Body(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Mounted but not capturing: before the first start, while the operator
    /// has paused the scanner, or after unmount.
    Idle,
    Scanning,
    AwaitingServer,
    ShowingResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanCycleEvent {
    StateChanged(ControllerState),
    OutcomeReceived(ScanOutcome),
    TransportFailed(String),
    ScannerToggled { running: bool },
}

/// Owns the repeating capture, submit, display, resume loop for one decoder
/// and one display region.
///
/// Constructed on view mount and torn down with [`unmount`]; exactly one
/// instance owns its decoder for that lifetime. The decoder is stopped as
/// soon as a detection arrives and restarted only at the shared resume point,
/// so it is never running while a submission is in flight or a result is
/// showing.
///
/// [`unmount`]: ScanCycleController::unmount
pub struct ScanCycleController {
    http: Client,
    scan_url: Url,
    decoder: Arc<dyn QrDecoder>,
    panel: Arc<dyn ResultPanel>,
    result_display_delay: Duration,
    inner: Mutex<ControllerInner>,
    events: broadcast::Sender<ScanCycleEvent>,
}

struct ControllerInner {
    state: ControllerState,
    paused: bool,
    cycle_task: Option<JoinHandle<()>>,
}

impl ScanCycleController {
    pub fn new(
        server_url: &str,
        operator: UserId,
        decoder: Arc<dyn QrDecoder>,
        panel: Arc<dyn ResultPanel>,
    ) -> Result<Arc<Self>> {
        Self::with_display_delay(server_url, operator, decoder, panel, RESULT_DISPLAY_DELAY)
    }

    pub fn with_display_delay(
        server_url: &str,
        operator: UserId,
        decoder: Arc<dyn QrDecoder>,
        panel: Arc<dyn ResultPanel>,
        result_display_delay: Duration,
    ) -> Result<Arc<Self>> {
        let base = Url::parse(server_url)
            .with_context(|| format!("invalid server url '{server_url}'"))?;
        let mut scan_url = base
            .join(SCAN_ENDPOINT_PATH)
            .context("failed to build scan endpoint url")?;
        scan_url
            .query_pairs_mut()
            .append_pair("user_id", &operator.0.to_string());

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            http: Client::new(),
            scan_url,
            decoder,
            panel,
            result_display_delay,
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Idle,
                paused: false,
                cycle_task: None,
            }),
            events,
        }))
    }

    /// Starts the decoder and the cycle loop. Fails if already mounted.
    pub async fn mount(self: &Arc<Self>) -> Result<()> {
        let detections = self.decoder.subscribe_detections();
        {
            let mut inner = self.inner.lock().await;
            if inner.cycle_task.is_some() {
                return Err(anyhow!("scan controller is already mounted"));
            }
            self.decoder
                .start()
                .await
                .context("failed to start decoder")?;
            inner.state = ControllerState::Scanning;
            inner.paused = false;
            inner.cycle_task = Some(tokio::spawn(
                Arc::clone(self).run_cycles(detections),
            ));
        }
        let _ = self
            .events
            .send(ScanCycleEvent::StateChanged(ControllerState::Scanning));
        Ok(())
    }

    /// Aborts the cycle loop, including any pending resume timer, stops the
    /// decoder, and clears the display. Nothing touches the display after
    /// this returns.
    pub async fn unmount(&self) {
        let task = {
            let mut inner = self.inner.lock().await;
            inner.state = ControllerState::Idle;
            inner.paused = false;
            inner.cycle_task.take()
        };
        let Some(task) = task else {
            return;
        };
        task.abort();
        if let Err(error) = self.decoder.stop().await {
            debug!(%error, "decoder stop failed during unmount");
        }
        self.panel.clear().await;
        let _ = self
            .events
            .send(ScanCycleEvent::StateChanged(ControllerState::Idle));
    }

    /// The manual toggle control. While scanning it stops or restarts the
    /// decoder immediately; mid-cycle the decoder is already stopped, so the
    /// toggle only flips the paused flag that the resume point honors.
    /// Returns whether the scanner is (or will be) running.
    pub async fn toggle_scanner(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.cycle_task.is_none() {
            return Err(anyhow!("scan controller is not mounted"));
        }
        let running = match inner.state {
            ControllerState::Scanning => {
                self.decoder.stop().await.context("failed to stop decoder")?;
                inner.paused = true;
                inner.state = ControllerState::Idle;
                drop(inner);
                let _ = self
                    .events
                    .send(ScanCycleEvent::StateChanged(ControllerState::Idle));
                false
            }
            ControllerState::Idle => {
                self.decoder
                    .start()
                    .await
                    .context("failed to start decoder")?;
                inner.paused = false;
                inner.state = ControllerState::Scanning;
                drop(inner);
                let _ = self
                    .events
                    .send(ScanCycleEvent::StateChanged(ControllerState::Scanning));
                true
            }
            ControllerState::AwaitingServer | ControllerState::ShowingResult => {
                inner.paused = !inner.paused;
                !inner.paused
            }
        };
        let _ = self.events.send(ScanCycleEvent::ScannerToggled { running });
        Ok(running)
    }

    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ScanCycleEvent> {
        self.events.subscribe()
    }

    async fn run_cycles(self: Arc<Self>, mut detections: broadcast::Receiver<String>) {
        loop {
            let payload = match detections.recv().await {
                Ok(payload) => payload,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "detection receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            // A detection can race the toggle; only a scanning controller
            // accepts it.
            if self.state().await != ControllerState::Scanning {
                debug!("dropping detection received while not scanning");
                continue;
            }
            self.run_one_cycle(payload).await;
        }
    }

    /// One full cycle: stop the decoder, submit, display the outcome, hold it
    /// for the configured delay, then clear and resume. Success, rejection,
    /// and transport failure all leave through the same resume path.
    async fn run_one_cycle(&self, payload: String) {
        if let Err(error) = self.decoder.stop().await {
            warn!(%error, "decoder stop failed on detection");
        }
        self.set_state(ControllerState::AwaitingServer).await;
        self.panel.show(ResultBanner::detection(&payload)).await;

        let banner = match self.submit(&payload).await {
            Ok(outcome) => {
                let _ = self
                    .events
                    .send(ScanCycleEvent::OutcomeReceived(outcome.clone()));
                ResultBanner::from_outcome(&outcome)
            }
            Err(error) => {
                warn!(%error, "scan submission failed");
                let description = error.to_string();
                let _ = self
                    .events
                    .send(ScanCycleEvent::TransportFailed(description.clone()));
                ResultBanner::transport_failure(&description)
            }
        };

        self.panel.show(banner).await;
        self.set_state(ControllerState::ShowingResult).await;
        tokio::time::sleep(self.result_display_delay).await;
        self.panel.clear().await;
        self.resume().await;
    }

    async fn resume(&self) {
        let paused = self.inner.lock().await.paused;
        if paused {
            self.set_state(ControllerState::Idle).await;
            return;
        }
        if let Err(error) = self.decoder.start().await {
            warn!(%error, "decoder restart failed; scanner stays stopped");
            self.set_state(ControllerState::Idle).await;
            return;
        }
        self.set_state(ControllerState::Scanning).await;
    }

    async fn submit(&self, payload: &str) -> Result<ScanOutcome, TransportError> {
        let response = self
            .http
            .post(self.scan_url.clone())
            .form(&[("qr_data", payload)])
            .send()
            .await
            .map_err(TransportError::Send)?;
        response
            .json::<ScanOutcome>()
            .await
            .map_err(TransportError::Body)
    }

    async fn set_state(&self, state: ControllerState) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == state {
                return;
            }
            inner.state = state;
        }
        let _ = self.events.send(ScanCycleEvent::StateChanged(state));
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

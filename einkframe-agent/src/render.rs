//! Render gate: exclusive, settled access to the e-ink panel
//!
//! The panel accepts one command sequence at a time and needs several seconds
//! after each refresh before it can take another. `RenderGate` owns the panel
//! handle; every render goes through [`RenderGate::submit`], which:
//! - waits for its turn (one render device-wide)
//! - runs `prepare -> display -> sleep` on the blocking pool, then blinks the
//!   indicator if the frame went out
//! - holds the turn through the settle delay before releasing it
//!
//! Both guards are scope-bound, so a failing or panicking panel call still
//! releases the gate. Once [`RenderGate::close`] has been called, frames still
//! waiting for their turn are refused with [`RenderError::Closed`].

use crate::decode::Bitmap;
use crate::error::{RenderError, RenderStage};
use crate::indicator::Indicator;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as TurnLock;
use tokio::task;
use tracing::{debug, error, info};

/// Blocking panel driver. Implementations are not reentrant.
pub trait EinkPanel: Send {
    fn prepare(&mut self) -> Result<(), RenderError>;
    fn display(&mut self, bitmap: &Bitmap) -> Result<(), RenderError>;
    /// Put the controller to sleep and release the bus
    fn sleep(&mut self) -> Result<(), RenderError>;
}

pub struct RenderGate {
    turn: TurnLock<()>,
    panel: Arc<Mutex<Box<dyn EinkPanel>>>,
    settle: Duration,
    closed: AtomicBool,
    indicator: Option<Arc<dyn Indicator>>,
}

impl RenderGate {
    pub fn new(panel: Box<dyn EinkPanel>, settle: Duration) -> Self {
        Self {
            turn: TurnLock::new(()),
            panel: Arc::new(Mutex::new(panel)),
            settle,
            closed: AtomicBool::new(false),
            indicator: None,
        }
    }

    /// Blink `indicator` after every successful render, before the settle
    pub fn with_indicator(mut self, indicator: Arc<dyn Indicator>) -> Self {
        self.indicator = Some(indicator);
        self
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle
    }

    /// Render one bitmap. Returns after the settle delay has elapsed.
    pub async fn submit(&self, bitmap: Bitmap) -> Result<(), RenderError> {
        let _turn = self.turn.lock().await;
        if self.closed.load(Ordering::Acquire) {
            debug!("Render gate closed, frame discarded");
            return Err(RenderError::Closed);
        }
        let started = Instant::now();

        let panel = self.panel.clone();
        let indicator = self.indicator.clone();
        let outcome = task::spawn_blocking(move || {
            let rendered = {
                let mut panel = panel.lock();
                run_cycle(panel.as_mut(), &bitmap)
            };
            if let (Ok(()), Some(indicator)) = (&rendered, indicator) {
                indicator.blink();
            }
            rendered
        })
        .await
        .map_err(|e| RenderError::Worker(e.to_string()))
        .and_then(|result| result);

        match &outcome {
            Ok(()) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "Frame rendered"),
            Err(e) => error!(error = %e, "Render failed"),
        }

        debug!(settle_ms = self.settle.as_millis() as u64, "Waiting for panel to settle");
        tokio::time::sleep(self.settle).await;
        outcome
    }

    /// Refuse every frame not yet rendering, then wait for the in-flight
    /// render and its settle. No render starts afterwards.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _turn = self.turn.lock().await;
        debug!("Render gate closed");
    }
}

/// prepare/sleep bracket every display call; sleep runs even if display fails
fn run_cycle(panel: &mut dyn EinkPanel, bitmap: &Bitmap) -> Result<(), RenderError> {
    debug!("Prepare e-ink screen");
    panel.prepare()?;

    let displayed = panel.display(bitmap);

    debug!("Send e-ink screen to sleep");
    let slept = panel.sleep();

    displayed.and(slept)
}

/// Panel stand-in for boards without a display attached
#[derive(Debug, Default)]
pub struct LoggingPanel {
    frames: u64,
}

impl EinkPanel for LoggingPanel {
    fn prepare(&mut self) -> Result<(), RenderError> {
        debug!("Logging panel prepare");
        Ok(())
    }

    fn display(&mut self, bitmap: &Bitmap) -> Result<(), RenderError> {
        self.frames += 1;
        info!(
            frame = self.frames,
            width = bitmap.width,
            height = bitmap.height,
            bytes = bitmap.pixels.len(),
            "Logging panel display"
        );
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), RenderError> {
        debug!("Logging panel sleep");
        Ok(())
    }
}

/// Writes the most recent frame to a file, for development and kiosk setups
pub struct FilePanel {
    path: PathBuf,
    ready: bool,
}

impl FilePanel {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RenderError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| RenderError::Init(format!("{}: {}", parent.display(), e)))?;
        }
        Ok(Self { path, ready: false })
    }
}

impl EinkPanel for FilePanel {
    fn prepare(&mut self) -> Result<(), RenderError> {
        self.ready = true;
        Ok(())
    }

    fn display(&mut self, bitmap: &Bitmap) -> Result<(), RenderError> {
        if !self.ready {
            return Err(RenderError::hardware(RenderStage::Display, "panel not prepared"));
        }
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, &bitmap.pixels)
            .and_then(|_| std::fs::rename(&staging, &self.path))
            .map_err(|e| RenderError::hardware(RenderStage::Display, e.to_string()))
    }

    fn sleep(&mut self) -> Result<(), RenderError> {
        self.ready = false;
        Ok(())
    }
}

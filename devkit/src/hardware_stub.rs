/*!
Mock frame hardware

Clones share state, so a test keeps one copy for assertions and hands the
other to the agent.
*/

use einkframe_agent::decode::Bitmap;
use einkframe_agent::error::{PowerError, RenderError, RenderStage};
use einkframe_agent::indicator::Indicator;
use einkframe_agent::power::PowerMonitor;
use einkframe_agent::render::EinkPanel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// One prepare..sleep cycle as seen by the panel
#[derive(Debug, Clone, Copy)]
pub struct RenderSpan {
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct PanelState {
    spans: Vec<RenderSpan>,
    frames: Vec<usize>,
    open: Option<Instant>,
    active: usize,
    max_active: usize,
    sleeps: usize,
    fail_displays: usize,
}

#[derive(Clone, Default)]
pub struct MockPanel {
    state: Arc<Mutex<PanelState>>,
}

impl MockPanel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` display calls fail
    pub fn fail_displays(&self, count: usize) {
        self.state.lock().fail_displays = count;
    }

    pub fn spans(&self) -> Vec<RenderSpan> {
        self.state.lock().spans.clone()
    }

    /// Number of successful display calls
    pub fn frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn sleeps(&self) -> usize {
        self.state.lock().sleeps
    }

    /// Highest number of cycles ever in progress at once
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_active
    }
}

impl EinkPanel for MockPanel {
    fn prepare(&mut self) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        state.open = Some(Instant::now());
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        Ok(())
    }

    fn display(&mut self, bitmap: &Bitmap) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        if state.fail_displays > 0 {
            state.fail_displays -= 1;
            return Err(RenderError::hardware(RenderStage::Display, "injected failure"));
        }
        state.frames.push(bitmap.pixels.len());
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), RenderError> {
        let mut state = self.state.lock();
        let finished = Instant::now();
        let started = state.open.take().unwrap_or(finished);
        state.spans.push(RenderSpan { started, finished });
        state.active = state.active.saturating_sub(1);
        state.sleeps += 1;
        Ok(())
    }
}

struct PowerState {
    /// `None` makes reads fail
    wired: Option<bool>,
    battery: Option<u8>,
    shutdowns_prepared: usize,
}

#[derive(Clone)]
pub struct MockPowerMonitor {
    state: Arc<Mutex<PowerState>>,
}

impl MockPowerMonitor {
    pub fn new(wired: bool, battery: Option<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PowerState {
                wired: Some(wired),
                battery,
                shutdowns_prepared: 0,
            })),
        }
    }

    pub fn set_wired(&self, wired: Option<bool>) {
        self.state.lock().wired = wired;
    }

    pub fn set_battery(&self, battery: Option<u8>) {
        self.state.lock().battery = battery;
    }

    pub fn shutdowns_prepared(&self) -> usize {
        self.state.lock().shutdowns_prepared
    }
}

impl Default for MockPowerMonitor {
    fn default() -> Self {
        Self::new(true, Some(100))
    }
}

impl PowerMonitor for MockPowerMonitor {
    fn wired(&self) -> Result<bool, PowerError> {
        self.state
            .lock()
            .wired
            .ok_or_else(|| PowerError::Bus("injected read failure".to_string()))
    }

    fn charge_level(&self) -> Result<Option<u8>, PowerError> {
        Ok(self.state.lock().battery)
    }

    fn prepare_shutdown(&self) -> Result<(), PowerError> {
        self.state.lock().shutdowns_prepared += 1;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockIndicator {
    blinks: Arc<AtomicUsize>,
}

impl MockIndicator {
    pub fn blinks(&self) -> usize {
        self.blinks.load(Ordering::SeqCst)
    }
}

impl Indicator for MockIndicator {
    fn blink(&self) {
        self.blinks.fetch_add(1, Ordering::SeqCst);
    }
}

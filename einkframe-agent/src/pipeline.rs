//! Display pipeline: decode, then render through the gate
//!
//! Runs once per admitted display message, on its own task. The session loop
//! never waits for it.

use crate::decode::ImageDecoder;
use crate::error::PipelineError;
use crate::render::RenderGate;
use crate::session::InboundMessage;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct DisplayPipeline {
    decoder: Arc<dyn ImageDecoder>,
    gate: Arc<RenderGate>,
}

impl DisplayPipeline {
    pub fn new(decoder: Arc<dyn ImageDecoder>, gate: Arc<RenderGate>) -> Self {
        Self { decoder, gate }
    }

    pub async fn process(&self, message: InboundMessage) -> Result<(), PipelineError> {
        debug!(id = %message.id, bytes = message.payload.len(), "Decoding display payload");
        let bitmap = self.decoder.decode(&message.payload)?;

        self.gate.submit(bitmap).await?;
        info!(id = %message.id, "Display message rendered");
        Ok(())
    }

    /// Let the in-flight render finish and refuse the rest
    pub async fn close(&self) {
        self.gate.close().await;
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Bitmap, RawFrameDecoder};
    use crate::dedup::MessageId;
    use crate::error::{DecodeError, RenderError};
    use crate::indicator::Indicator;
    use crate::render::EinkPanel;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        displays: Arc<AtomicUsize>,
        blinks: Arc<AtomicUsize>,
    }

    struct CountingPanel(Arc<AtomicUsize>);

    impl EinkPanel for CountingPanel {
        fn prepare(&mut self) -> Result<(), RenderError> {
            Ok(())
        }
        fn display(&mut self, _bitmap: &Bitmap) -> Result<(), RenderError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn sleep(&mut self) -> Result<(), RenderError> {
            Ok(())
        }
    }

    struct CountingIndicator(Arc<AtomicUsize>);

    impl Indicator for CountingIndicator {
        fn blink(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pipeline(counts: &Counting) -> DisplayPipeline {
        let gate = RenderGate::new(
            Box::new(CountingPanel(counts.displays.clone())),
            Duration::ZERO,
        )
        .with_indicator(Arc::new(CountingIndicator(counts.blinks.clone())));
        DisplayPipeline::new(Arc::new(RawFrameDecoder::new(2, 2)), Arc::new(gate))
    }

    fn message(payload: Vec<u8>) -> InboundMessage {
        InboundMessage {
            id: MessageId::new("m"),
            received_at: Utc::now(),
            payload: payload.into(),
        }
    }

    #[tokio::test]
    async fn test_render_then_blink() {
        let counts = Counting::default();
        pipeline(&counts).process(message(vec![0; 4])).await.unwrap();

        assert_eq!(counts.displays.load(Ordering::SeqCst), 1);
        assert_eq!(counts.blinks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_skips_render_and_blink() {
        let counts = Counting::default();
        let result = pipeline(&counts).process(message(vec![])).await;

        assert!(matches!(result, Err(PipelineError::Decode(DecodeError::Empty))));
        assert_eq!(counts.displays.load(Ordering::SeqCst), 0);
        assert_eq!(counts.blinks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_pipeline_refuses_messages() {
        let counts = Counting::default();
        let pipeline = pipeline(&counts);
        pipeline.close().await;

        let result = pipeline.process(message(vec![0; 4])).await;
        assert!(matches!(result, Err(PipelineError::Render(RenderError::Closed))));
        assert_eq!(counts.displays.load(Ordering::SeqCst), 0);
    }
}

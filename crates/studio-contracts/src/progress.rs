use serde::Serialize;

pub const LABEL_SAVING_INPUT: &str = "Saving uploaded image";
pub const LABEL_STARTING: &str = "Starting Gemini AI generation";
pub const LABEL_UPLOADING: &str = "Uploading file to Gemini";
pub const LABEL_WAITING: &str = "Waiting for Gemini's response";
pub const LABEL_RECEIVING: &str = "Receiving response from Gemini";
pub const LABEL_IMAGE_RECEIVED: &str = "Image data received, saving...";
pub const LABEL_STREAM_DONE: &str = "Processing complete";
pub const LABEL_PROCESSING_RESULT: &str = "Processing result";
pub const LABEL_COMPLETE: &str = "Complete!";

const RECEIVING_BASE: f32 = 0.2;
const RECEIVING_SPAN: f32 = 0.6;
const RECEIVING_SATURATION_CHUNKS: f32 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSignal {
    pub fraction: f32,
    pub label: String,
}

impl ProgressSignal {
    pub fn new(fraction: f32, label: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            label: label.into(),
        }
    }

    /// Milestone for the n-th content-bearing chunk; saturates at 0.8.
    pub fn receiving(chunk_count: usize) -> Self {
        let scaled = RECEIVING_SPAN * (chunk_count as f32 / RECEIVING_SATURATION_CHUNKS);
        Self::new(RECEIVING_BASE + scaled.min(RECEIVING_SPAN), LABEL_RECEIVING)
    }
}

pub trait ProgressSink {
    fn report(&self, signal: ProgressSignal);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressSignal),
{
    fn report(&self, signal: ProgressSignal) {
        self(signal)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _signal: ProgressSignal) {}
}

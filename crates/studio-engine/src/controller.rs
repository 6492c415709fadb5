use image::{DynamicImage, RgbImage};
use studio_contracts::generation::{GenerationRequest, GenerationResult};
use studio_contracts::notification::Notification;
use studio_contracts::progress::{
    ProgressSignal, ProgressSink, LABEL_COMPLETE, LABEL_PROCESSING_RESULT, LABEL_SAVING_INPUT,
    LABEL_STARTING,
};
use studio_contracts::Result;
use tracing::{info, warn};

use crate::adapter::{GenerationTransport, RequestAdapter};
use crate::artifacts::ScratchSpace;
use crate::imaging::{self, INPUT_JPEG_QUALITY};
use crate::EngineConfig;

/// What the UI shows after a request: either an image (for both the gallery
/// and the download slot) or the model's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformation {
    pub display: Option<RgbImage>,
    pub text: String,
    pub download: Option<RgbImage>,
}

impl Transformation {
    fn image(image: RgbImage) -> Self {
        Self {
            display: Some(image.clone()),
            text: String::new(),
            download: Some(image),
        }
    }

    fn text(text: String) -> Self {
        Self {
            display: None,
            text,
            download: None,
        }
    }

    pub fn has_image(&self) -> bool {
        self.download.is_some()
    }
}

pub struct InteractionController<T> {
    adapter: RequestAdapter<T>,
    scratch: ScratchSpace,
    model: String,
}

impl<T: GenerationTransport> InteractionController<T> {
    pub fn new(adapter: RequestAdapter<T>, config: &EngineConfig) -> Self {
        Self {
            adapter,
            scratch: ScratchSpace::new(config.scratch_dir.clone()),
            model: config.model.clone(),
        }
    }

    pub fn adapter(&self) -> &RequestAdapter<T> {
        &self.adapter
    }

    pub fn process(
        &self,
        image: &DynamicImage,
        prompt: &str,
        progress: &dyn ProgressSink,
    ) -> Result<Transformation> {
        progress.report(ProgressSignal::new(0.1, LABEL_SAVING_INPUT));
        let jpeg = imaging::encode_jpeg(image, INPUT_JPEG_QUALITY)?;
        let input = self.scratch.write_artifact(&jpeg, ".jpg")?;

        progress.report(ProgressSignal::new(0.2, LABEL_STARTING));
        let request = GenerationRequest::new(input.path(), prompt, self.model.as_str());
        let generated = self.adapter.generate(&request, progress);
        drop(input);

        let transformation = match generated? {
            GenerationResult::Image { bytes, .. } => {
                progress.report(ProgressSignal::new(0.9, LABEL_PROCESSING_RESULT));
                Transformation::image(imaging::decode_opaque(&bytes)?)
            }
            GenerationResult::Text { text } => Transformation::text(text),
        };

        progress.report(ProgressSignal::new(1.0, LABEL_COMPLETE));
        info!(image = transformation.has_image(), "transformation complete");
        Ok(transformation)
    }

    /// UI entry point: every failure becomes a dismissable notification.
    pub fn handle(
        &self,
        image: &DynamicImage,
        prompt: &str,
        progress: &dyn ProgressSink,
    ) -> std::result::Result<Transformation, Notification> {
        self.process(image, prompt, progress).map_err(|err| {
            warn!(kind = ?err.kind(), error = %err, "transformation failed");
            Notification::error(err)
        })
    }
}

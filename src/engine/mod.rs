//! Engine implementations.
//!
//! An engine receives one `InputFrame` at a time and returns a
//! `ResultWrapper`, or an `EngineError` that the runner reports back to the
//! client as `ENGINE_ERROR`.
//!
//! ## Variants
//! - `roundtrip`: echo the first image payload unchanged
//! - `rotate`: rotate the image 270 degrees and re-encode as JPEG
//! - `crash`: rotate, dump to disk, then fault on purpose

pub mod crash;
pub mod roundtrip;
pub mod rotate;
mod transform;

pub use crash::CrashEngine;
pub use roundtrip::RoundTripEngine;
pub use rotate::RotateEngine;

use crate::config::{Config, EngineKind};
use crate::protocol::{InputFrame, PayloadType, ResultWrapper};
use std::sync::Arc;

/// Faults raised by an engine while handling a frame.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("image frame carries no payload")]
    MissingPayload,
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine faulted on purpose")]
    Deliberate,
}

/// Pluggable per-connection frame handler.
///
/// Handlers are stateless, so one instance serves every in-flight frame of
/// its connection.
pub trait Engine: Send + Sync {
    fn handle(&self, input_frame: InputFrame) -> Result<ResultWrapper, EngineError>;
}

/// Builds one engine per connection.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn Engine> + Send + Sync>;

/// Build the factory for the configured engine variant.
pub fn factory(config: &Config) -> EngineFactory {
    match config.engine {
        EngineKind::Roundtrip => Arc::new(|| -> Box<dyn Engine> { Box::new(RoundTripEngine) }),
        EngineKind::Rotate => {
            let quality = config.jpeg_quality;
            Arc::new(move || -> Box<dyn Engine> { Box::new(RotateEngine::new(quality)) })
        }
        EngineKind::Crash => {
            let quality = config.jpeg_quality;
            let dump_path = config.dump_path.clone();
            Arc::new(move || -> Box<dyn Engine> {
                Box::new(CrashEngine::new(quality, dump_path.clone()))
            })
        }
    }
}

/// Return the first payload of an IMAGE frame.
///
/// `Ok(None)` means the frame is not an image and should be answered with
/// `WRONG_INPUT_FORMAT`.
fn image_payload(input_frame: &InputFrame) -> Result<Option<&[u8]>, EngineError> {
    // Compare the raw tag: the typed accessor maps unknown values to IMAGE.
    if input_frame.payload_type != PayloadType::Image as i32 {
        return Ok(None);
    }

    input_frame
        .payloads
        .first()
        .map(|payload| Some(payload.as_slice()))
        .ok_or(EngineError::MissingPayload)
}

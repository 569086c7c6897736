//! Rotation engine: decodes the image, rotates it 270 degrees and returns JPEG.

use super::transform::rotate_to_jpeg;
use super::{image_payload, Engine, EngineError};
use crate::protocol::result_wrapper::{self, Status};
use crate::protocol::{create_result_wrapper, InputFrame, PayloadType, ResultWrapper};

#[derive(Debug, Clone, Copy)]
pub struct RotateEngine {
    jpeg_quality: u8,
}

impl RotateEngine {
    pub fn new(jpeg_quality: u8) -> Self {
        Self { jpeg_quality }
    }
}

impl Engine for RotateEngine {
    fn handle(&self, input_frame: InputFrame) -> Result<ResultWrapper, EngineError> {
        let payload = match image_payload(&input_frame)? {
            Some(payload) => payload,
            None => return Ok(create_result_wrapper(Status::WrongInputFormat)),
        };

        let rotated = rotate_to_jpeg(payload, self.jpeg_quality)?;

        let mut wrapper = create_result_wrapper(Status::Success);
        wrapper
            .results
            .push(result_wrapper::Result::new(PayloadType::Image, rotated));
        Ok(wrapper)
    }
}

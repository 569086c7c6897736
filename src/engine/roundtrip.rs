//! Round-trip engine: returns the first image payload untouched.

use super::{image_payload, Engine, EngineError};
use crate::protocol::result_wrapper::{self, Status};
use crate::protocol::{create_result_wrapper, InputFrame, PayloadType, ResultWrapper};

#[derive(Debug, Default, Clone, Copy)]
pub struct RoundTripEngine;

impl Engine for RoundTripEngine {
    fn handle(&self, input_frame: InputFrame) -> Result<ResultWrapper, EngineError> {
        let payload = match image_payload(&input_frame)? {
            Some(payload) => payload.to_vec(),
            None => return Ok(create_result_wrapper(Status::WrongInputFormat)),
        };

        let mut wrapper = create_result_wrapper(Status::Success);
        wrapper
            .results
            .push(result_wrapper::Result::new(PayloadType::Image, payload));
        Ok(wrapper)
    }
}

//! Crash engine: exercises the runner's fault path.
//!
//! Runs the same validation and rotation as `RotateEngine`, writes the
//! rotated JPEG to a fixed path, then always returns
//! `EngineError::Deliberate` instead of a result.

use super::transform::rotate_to_jpeg;
use super::{image_payload, Engine, EngineError};
use crate::protocol::result_wrapper::Status;
use crate::protocol::{create_result_wrapper, InputFrame, ResultWrapper};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CrashEngine {
    jpeg_quality: u8,
    dump_path: PathBuf,
}

impl CrashEngine {
    pub fn new(jpeg_quality: u8, dump_path: PathBuf) -> Self {
        Self {
            jpeg_quality,
            dump_path,
        }
    }
}

impl CrashEngine {
    /// Write into a sibling temp file and rename it over `dump_path`, so
    /// concurrent frames never leave an interleaved file behind.
    fn dump(&self, jpeg: &[u8]) -> std::io::Result<()> {
        let dir = match self.dump_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(jpeg)?;
        file.persist(&self.dump_path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl Engine for CrashEngine {
    fn handle(&self, input_frame: InputFrame) -> Result<ResultWrapper, EngineError> {
        let payload = match image_payload(&input_frame)? {
            Some(payload) => payload,
            None => return Ok(create_result_wrapper(Status::WrongInputFormat)),
        };

        let rotated = rotate_to_jpeg(payload, self.jpeg_quality)?;
        self.dump(&rotated)?;
        debug!(path = %self.dump_path.display(), bytes = rotated.len(), "Wrote rotated image");

        Err(EngineError::Deliberate)
    }
}

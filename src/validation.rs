//! Frame validation utilities.
//!
//! Freshly opened devices on commodity hardware often hand back empty or
//! truncated buffers for the first few reads. These checks decide whether a
//! frame is worth passing on to a caller.

use crate::traits::{CameraError, Frame, Result};

/// Whether a frame carries image data.
///
/// A frame is usable when its buffer is non-empty and the driver reported
/// a non-zero payload.
pub fn is_usable_frame(frame: &Frame) -> bool {
    !frame.data.is_empty() && frame.metadata.bytes_used > 0
}

/// Validates that a sequence of frames has strictly increasing sequence numbers.
///
/// Gaps are allowed (the streaming loop drops bad reads); reordering and
/// duplicates are not, since either means two readers raced on the device.
///
/// # Errors
///
/// Returns `StreamError` if:
/// - The frames slice is empty
/// - Any sequence number is not greater than the previous one
pub fn validate_frame_order(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::StreamError(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (index, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else {
            continue;
        };
        let prev_seq = prev.metadata.sequence;
        let curr_seq = curr.metadata.sequence;

        if curr_seq <= prev_seq {
            return Err(CameraError::StreamError(format!(
                "Frame order violated at index {}: {curr_seq} follows {prev_seq}",
                index + 1
            )));
        }
    }

    Ok(())
}

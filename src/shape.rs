//! Shape compatibility for dynamic batching.
//!
//! A batch may only contain requests whose enforced inputs agree: equal
//! declared dimensions, and for shape tensors equal tensor contents as
//! well. The comparison is strict, with no broadcasting.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ScheduleError;
use crate::payload::{Payload, RequestInput};

/// Runner-supplied closure that materializes a shape tensor's contents
/// without consuming the payload. Must be non-blocking; it is invoked with
/// the scheduler lock held.
pub type PeekShapeFn =
    Arc<dyn Fn(u64, &RequestInput, &Payload) -> Result<Vec<i64>, ScheduleError> + Send + Sync>;

/// Declared dimensions and (for shape tensors) contents of the enforced
/// inputs of the first payload claimed into a pending batch.
#[derive(Debug, Default, Clone)]
pub struct PendingBatchShapes {
    shapes: HashMap<String, (Vec<i64>, Vec<i64>)>,
}

/// Record the enforced shapes of the first payload of a forming batch.
///
/// A peek failure propagates; the caller must not claim the payload.
pub fn init_pending_shape(
    runner_id: u64,
    payload: &Payload,
    enforce_equal_shape_tensors: &HashMap<String, bool>,
    peek: &PeekShapeFn,
) -> Result<PendingBatchShapes, ScheduleError> {
    let mut shapes = HashMap::new();
    for input in &payload.request.inputs {
        if let Some(&is_shape_tensor) = enforce_equal_shape_tensors.get(&input.name) {
            // Shape tensors must match on contents in addition to the
            // tensor shape itself.
            let contents = if is_shape_tensor {
                peek(runner_id, input, payload)?
            } else {
                Vec::new()
            };
            shapes.insert(input.name.clone(), (input.dims.clone(), contents));
        }
    }
    Ok(PendingBatchShapes { shapes })
}

/// Whether `payload` can join the batch described by `pending`. Inputs
/// absent from the pending map are ignored; a peek failure conservatively
/// counts as a mismatch.
pub fn compare_with_pending_shape(
    runner_id: u64,
    payload: &Payload,
    peek: &PeekShapeFn,
    pending: &PendingBatchShapes,
) -> bool {
    for input in &payload.request.inputs {
        if let Some((dims, contents)) = pending.shapes.get(&input.name) {
            if dims != &input.dims {
                return false;
            }
            if !contents.is_empty() {
                match peek(runner_id, input, payload) {
                    Ok(peeked) if &peeked == contents => {}
                    _ => return false,
                }
            }
        }
    }
    true
}

//! Area-limit recovery.
//!
//! Some upstream sources refuse requests over a size threshold with an
//! area-limit error. Recovery is mechanical: split the bounding box into its
//! four quadrants and run each independently, recursing up to a configured
//! depth. Each quadrant may itself split again; anything else surfaces as a
//! normal failure.

use std::future::Future;

use tracing::info;

use crate::error::{ExportError, Result};
use crate::geo::Bbox;

/// Run `op` over `bbox`, splitting into quadrants on
/// [`ExportError::AreaLimitExceeded`] up to `max_depth` levels. Returns the
/// results of every leaf invocation in completion order.
pub async fn with_area_splitting<T, F, Fut>(bbox: Bbox, max_depth: u32, op: F) -> Result<Vec<T>>
where
    F: Fn(Bbox) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut results = Vec::new();
    let mut pending = vec![(bbox, 0u32)];

    while let Some((current, depth)) = pending.pop() {
        match op(current).await {
            Ok(value) => results.push(value),
            Err(ExportError::AreaLimitExceeded { .. }) if depth < max_depth => {
                info!(bbox = %current, depth = depth, "Area limit exceeded, splitting into quadrants");
                for quadrant in current.quadrants() {
                    pending.push((quadrant, depth + 1));
                }
            }
            Err(err) => return Err(err),
        }
    }

    Ok(results)
}

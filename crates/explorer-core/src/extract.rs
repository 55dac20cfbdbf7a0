//! Extraction of the formatter's JSON payload from raw process output.
//!
//! Coverage banners and warnings from other gems end up on the same stream,
//! so the formatter wraps its document in sentinel markers instead of
//! owning the whole of stdout.

/// Marker written immediately before the opening brace.
pub const JSON_START_MARKER: &str = "START_OF_TEST_JSON";

/// Marker written immediately after the closing brace.
pub const JSON_END_MARKER: &str = "END_OF_TEST_JSON";

/// Marker on the line that announces the final summary.
pub const SUMMARY_READY_MARKER: &str = "START_OF_RSPEC_JSON";

/// Return the `{...}` span between the first start marker and the last end
/// marker, braces included.
///
/// The payload is not validated; decoding is up to the caller. Returns
/// `None` when either marker is missing or they are out of order.
pub fn extract_json(output: &str) -> Option<&str> {
    let open = output.find(&format!("{JSON_START_MARKER}{{"))? + JSON_START_MARKER.len();
    let close = output.rfind(&format!("}}{JSON_END_MARKER}"))? + 1;
    (open < close).then(|| &output[open..close])
}

//! Deterministic capture-size negotiation.

use signcast_core::Size;

/// Maximum |aspect-ratio difference| for a size to count as a match.
pub const ASPECT_RATIO_TOLERANCE: f64 = 0.1;

/// Pick the output size to request from the device.
///
/// Exact match wins. Otherwise the minimum-area size among aspect-ratio
/// tolerant candidates; if none qualifies, the maximum-area size available.
/// An empty choice list falls back to the requested size unchanged.
pub fn choose_optimal_size(requested: Size, choices: &[Size]) -> Size {
    if choices.is_empty() {
        return requested;
    }

    if let Some(exact) = choices.iter().find(|s| **s == requested) {
        return *exact;
    }

    let target_ratio = requested.aspect_ratio();
    let tolerant: Vec<Size> = choices
        .iter()
        .copied()
        .filter(|s| (s.aspect_ratio() - target_ratio).abs() < ASPECT_RATIO_TOLERANCE)
        .collect();

    if let Some(best) = tolerant.iter().copied().min_by_key(Size::area) {
        best
    } else {
        // No acceptable aspect ratio at all: take the biggest the device has.
        choices
            .iter()
            .copied()
            .max_by_key(Size::area)
            .expect("choices is non-empty")
    }
}

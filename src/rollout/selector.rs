//! Per-opportunity implementation choice.

use rand::Rng;

use super::RolloutState;
use crate::engine::ImplementationTag;

/// Route to the optimized engine with probability `traffic_percentage / 100`.
pub fn choose_implementation<R: Rng + ?Sized>(
    state: &RolloutState,
    rng: &mut R,
) -> ImplementationTag {
    match state.traffic_percentage {
        0 => ImplementationTag::Reference,
        pct if pct >= 100 => ImplementationTag::Optimized,
        pct => {
            if rng.gen_range(0..100u8) < pct {
                ImplementationTag::Optimized
            } else {
                ImplementationTag::Reference
            }
        }
    }
}

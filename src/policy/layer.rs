use serde::Serialize;

use super::TempestState;
use crate::error::{GateError, GateResult};

pub const MAX_LAYER: u32 = 8;

/// Fixed per-layer capture ceiling and TEMPEST floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LayerPolicy {
    pub layer: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub min_tempest: TempestState,
    /// L7/L8 handle quantum-candidate workloads.
    pub quantum_candidate: bool,
}

impl LayerPolicy {
    pub fn allows_resolution(&self, width: u32, height: u32) -> bool {
        width <= self.max_width && height <= self.max_height
    }

    pub fn allows_tempest(&self, state: TempestState) -> bool {
        state >= self.min_tempest
    }
}

const fn layer(
    layer: u32,
    max_width: u32,
    max_height: u32,
    min_tempest: TempestState,
    quantum_candidate: bool,
) -> LayerPolicy {
    LayerPolicy {
        layer,
        max_width,
        max_height,
        min_tempest,
        quantum_candidate,
    }
}

// Floors are non-decreasing with the layer index.
static LAYER_POLICIES: [LayerPolicy; 9] = [
    layer(0, 3840, 2160, TempestState::Disabled, false),
    layer(1, 3840, 2160, TempestState::Disabled, false),
    layer(2, 1920, 1080, TempestState::Disabled, false),
    layer(3, 1280, 720, TempestState::Low, false),
    layer(4, 1280, 720, TempestState::Low, false),
    layer(5, 960, 540, TempestState::Low, false),
    layer(6, 640, 480, TempestState::High, false),
    layer(7, 640, 480, TempestState::High, true),
    layer(8, 320, 240, TempestState::High, true),
];

pub fn layer_policy(layer: u32) -> GateResult<&'static LayerPolicy> {
    LAYER_POLICIES
        .get(layer as usize)
        .ok_or_else(|| GateError::NotFound(format!("layer {} (valid: 0..={})", layer, MAX_LAYER)))
}

pub fn all_layer_policies() -> &'static [LayerPolicy] {
    &LAYER_POLICIES
}

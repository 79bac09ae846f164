//! Geological context supplied alongside a ring for feature engineering

use serde::{Deserialize, Serialize};

/// Soil classification used for one-hot encoding and model zone selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoilType {
    SoftClay,
    SandSilt,
    HardRock,
    Mixed,
    Transition,
}

impl SoilType {
    /// The fixed one-hot encoding set, in feature order.
    pub const ALL: [SoilType; 5] = [
        SoilType::SoftClay,
        SoilType::SandSilt,
        SoilType::HardRock,
        SoilType::Mixed,
        SoilType::Transition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SoilType::SoftClay => "soft_clay",
            SoilType::SandSilt => "sand_silt",
            SoilType::HardRock => "hard_rock",
            SoilType::Mixed => "mixed",
            SoilType::Transition => "transition",
        }
    }
}

/// Geological context for a ring. All fields optional; missing values fall
/// back to documented neutral constants in the feature engineer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeologicalContext {
    pub soil_type: Option<SoilType>,
    /// m below surface
    pub overburden_depth: Option<f64>,
    /// m relative to tunnel axis (negative = below)
    pub groundwater_level: Option<f64>,
    /// m to the nearest protected structure
    pub proximity_to_structures: Option<f64>,
}

use std::path::PathBuf;

use crate::Float;

/// Sample counts offered to the user, most expensive first.
pub const SAMPLE_PRESETS: [u32; 10] = [4096, 2048, 1024, 512, 256, 128, 64, 16, 4, 1];

/// Label shown for a sample preset, e.g. "64 Samples" or "1 Sample".
pub fn sample_preset_label(samples: u32) -> String {
    if samples == 1 {
        format!("{} Sample", samples)
    } else {
        format!("{} Samples", samples)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    /// Rows per work unit; 0 lets the engine decide.
    pub tile_size: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            samples: SAMPLE_PRESETS[0],
            tile_size: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnvironmentSettings {
    pub sky_intensity: Float,
    pub sun_intensity: Float,
    /// Degrees above the horizon.
    pub sun_elevation: Float,
    /// Degrees around the vertical axis.
    pub sun_rotation: Float,
    pub transparent_background: bool,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            sky_intensity: 1.0,
            sun_intensity: 1.0,
            sun_elevation: 45.0,
            sun_rotation: 0.0,
            transparent_background: false,
        }
    }
}

/// Which part of the loaded model gets rendered. `None` selects the model's default.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SceneSelection {
    pub model_path: Option<PathBuf>,
    pub scene: Option<usize>,
    pub material_variant: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_labels() {
        let labels: Vec<String> = SAMPLE_PRESETS.iter().map(|&s| sample_preset_label(s)).collect();
        assert_eq!(labels[0], "4096 Samples");
        assert_eq!(labels[9], "1 Sample");
    }
}

//! Conversion between the preview's camera and the camera struct understood by the
//! render engine.
//!
//! The preview describes a perspective camera by its *horizontal* field of view, while
//! the engine expects a *vertical* one, so every conversion goes through the view's
//! aspect ratio.

use cgmath::{Matrix4, SquareMatrix};

use crate::Float;

/// Projection of the preview camera.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Projection {
    /// Horizontal field of view, in degrees.
    Perspective { horizontal_fov: f64 },
    Orthographic { width: Float, height: Float },
}

/// Immutable camera snapshot pushed by the interactive view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraState {
    pub projection: Projection,
    /// Camera-to-world transform.
    pub transform: Matrix4<Float>,
    pub near_clip: Float,
    pub far_clip: Float,
}

impl CameraState {
    pub fn perspective(horizontal_fov: f64, transform: Matrix4<Float>, near_clip: Float, far_clip: Float) -> Self {
        Self {
            projection: Projection::Perspective { horizontal_fov },
            transform,
            near_clip,
            far_clip,
        }
    }
}

impl Default for CameraState {
    fn default() -> Self {
        Self::perspective(45.0, Matrix4::identity(), 0.125, 1000.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineProjection {
    Perspective,
    Orthographic,
}

impl Default for EngineProjection {
    fn default() -> Self {
        EngineProjection::Perspective
    }
}

/// Preset camera positions the engine can place on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraPreset {
    None,
    Front,
    Back,
    Left,
    Right,
    Top,
    Bottom,
}

impl Default for CameraPreset {
    fn default() -> Self {
        CameraPreset::None
    }
}

/// Camera as the engine sees it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineCamera {
    pub projection: EngineProjection,
    pub preset: CameraPreset,
    /// Camera-to-world transform, column-major. Anything other than 16 elements is
    /// treated as malformed.
    pub matrix: Vec<Float>,
    pub far_clip: Float,
    pub near_clip: Float,
    pub vertical_fov: Float,
    pub orthographic_width: Float,
    pub orthographic_height: Float,
}

/// Converts a horizontal field of view (degrees) into a vertical one for a view with
/// the given aspect ratio (width / height).
pub fn to_vertical_degrees_fov(horizontal_degrees: f64, aspect_ratio: f64) -> f64 {
    if aspect_ratio <= 0.0 {
        return horizontal_degrees;
    }
    if horizontal_degrees > 180.0 {
        return 180.0;
    }

    let horizontal = horizontal_degrees.to_radians();
    let vertical = 2.0 * ((horizontal / 2.0).tan() / aspect_ratio).atan();
    vertical.to_degrees()
}

/// Converts a vertical field of view (degrees) into a horizontal one for a view with
/// the given aspect ratio (width / height).
pub fn to_horizontal_degrees_fov(vertical_degrees: f64, aspect_ratio: f64) -> f64 {
    if vertical_degrees > 180.0 {
        return 180.0;
    }
    if aspect_ratio <= 0.0 {
        return vertical_degrees;
    }

    let vertical = vertical_degrees.to_radians();
    let horizontal = 2.0 * ((vertical / 2.0).tan() * aspect_ratio).atan();
    horizontal.to_degrees()
}

/// Builds the engine camera for a view of `view_width` x `view_height` pixels.
///
/// Only perspective cameras are supported; anything else produces a zeroed camera.
pub fn to_engine_camera(camera: &CameraState, view_width: u32, view_height: u32) -> EngineCamera {
    match camera.projection {
        Projection::Perspective { horizontal_fov } => {
            let aspect = if view_height > 0 {
                view_width as f64 / view_height as f64
            } else {
                1.0
            };
            let columns: [[Float; 4]; 4] = camera.transform.into();

            EngineCamera {
                projection: EngineProjection::Perspective,
                preset: CameraPreset::None,
                matrix: columns.iter().flatten().copied().collect(),
                far_clip: camera.far_clip,
                near_clip: camera.near_clip,
                vertical_fov: to_vertical_degrees_fov(horizontal_fov, aspect) as Float,
                ..EngineCamera::default()
            }
        }
        Projection::Orthographic { .. } => EngineCamera::default(),
    }
}

/// Recovers a preview camera from an engine camera (e.g. one stored in the model).
///
/// The field of view is converted with an aspect ratio of 1, since the engine camera
/// carries no view size.
pub fn from_engine_camera(camera: &EngineCamera) -> Option<CameraState> {
    if camera.projection != EngineProjection::Perspective || camera.matrix.len() != 16 {
        return None;
    }

    let mut columns = [[0.0 as Float; 4]; 4];
    for (column, chunk) in columns.iter_mut().zip(camera.matrix.chunks_exact(4)) {
        column.copy_from_slice(chunk);
    }
    let transform = Matrix4::from(columns);

    let horizontal_fov = to_horizontal_degrees_fov(camera.vertical_fov as f64, 1.0);
    Some(CameraState::perspective(horizontal_fov, transform, camera.near_clip, camera.far_clip))
}

//! Display transforms for linear render output.
//!
//! The engine exposes its colour management as a list of named "looks". Colour profile
//! index 0 is always the plain sRGB view transform; index `n >= 1` selects look `n - 1`.

use rayon::prelude::*;

use crate::Float;

/// Name of the colour profile at index 0.
pub const DEFAULT_PROFILE_NAME: &str = "Default sRGB";

/// Pixels handed to a worker at once when transforming a buffer in parallel.
const PIXELS_PER_JOB: usize = 4096;

/// Turns linear-light RGBA into display-referred RGBA, in place.
pub trait ColorProcessor: Send + Sync {
    /// Names of the looks this processor supports, in index order.
    fn looks(&self) -> &[String];

    /// Applies the look (or the default view transform for `None`) to the RGB channels
    /// of tightly packed RGBA pixels. Alpha is left alone.
    ///
    /// Returns false if the transform could not be applied; the pixels are then
    /// untouched.
    fn apply(&self, look: Option<usize>, rgba: &mut [Float]) -> bool;
}

/// The ordered list of colour profiles shown to the user.
#[derive(Clone, Debug, PartialEq)]
pub struct ColorProfiles {
    names: Vec<String>,
}

impl ColorProfiles {
    pub fn from_processor(processor: &dyn ColorProcessor) -> Self {
        let mut names = Vec::with_capacity(processor.looks().len() + 1);
        names.push(DEFAULT_PROFILE_NAME.to_string());
        names.extend(processor.looks().iter().cloned());
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Maps a profile index onto a processor look. Index 0 and anything out of range
/// select the default transform.
pub(crate) fn look_for_profile(profile_index: usize, profile_count: usize) -> Option<usize> {
    if profile_index >= 1 && profile_index < profile_count {
        Some(profile_index - 1)
    } else {
        None
    }
}

/// sRGB opto-electronic transfer function.
pub fn gamma_correct(v: Float) -> Float {
    if v <= 0.0031308 {
        12.92 * v
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// Fallback display transform when no colour management is available.
pub fn simple_gamma(v: Float) -> Float {
    v.max(0.0).powf(1.0 / 2.2)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToneCurve {
    Reinhard,
    AcesFilmic,
    Uncharted2,
}

impl ToneCurve {
    pub const ALL: [ToneCurve; 3] = [ToneCurve::Reinhard, ToneCurve::AcesFilmic, ToneCurve::Uncharted2];

    pub fn name(self) -> &'static str {
        match self {
            ToneCurve::Reinhard => "Reinhard",
            ToneCurve::AcesFilmic => "ACES Filmic",
            ToneCurve::Uncharted2 => "Uncharted 2",
        }
    }

    pub fn map(self, x: Float) -> Float {
        let x = x.max(0.0);
        match self {
            ToneCurve::Reinhard => x / (1.0 + x),
            ToneCurve::AcesFilmic => {
                let (a, b, c, d, e) = (2.51, 0.03, 2.43, 0.59, 0.14);
                ((x * (a * x + b)) / (x * (c * x + d) + e)).clamp(0.0, 1.0)
            }
            ToneCurve::Uncharted2 => {
                const WHITE_POINT: Float = 11.2;
                const EXPOSURE_BIAS: Float = 2.0;
                (uncharted2_partial(x * EXPOSURE_BIAS) / uncharted2_partial(WHITE_POINT)).min(1.0)
            }
        }
    }
}

fn uncharted2_partial(x: Float) -> Float {
    let (a, b, c, d, e, f) = (0.15, 0.50, 0.10, 0.20, 0.02, 0.30);
    ((x * (a * x + c * b) + d * e) / (x * (a * x + b) + d * f)) - e / f
}

/// Built-in colour processor: a handful of tone curves, each followed by the sRGB
/// transfer function.
pub struct ToneMapper {
    curves: Vec<ToneCurve>,
    names: Vec<String>,
}

impl ToneMapper {
    pub fn new(curves: Vec<ToneCurve>) -> Self {
        let names = curves.iter().map(|c| c.name().to_string()).collect();
        Self { curves, names }
    }
}

impl Default for ToneMapper {
    fn default() -> Self {
        Self::new(ToneCurve::ALL.to_vec())
    }
}

impl ColorProcessor for ToneMapper {
    fn looks(&self) -> &[String] {
        &self.names
    }

    fn apply(&self, look: Option<usize>, rgba: &mut [Float]) -> bool {
        let curve = match look {
            None => None,
            Some(index) => match self.curves.get(index) {
                Some(&curve) => Some(curve),
                None => return false,
            },
        };

        rgba.par_chunks_mut(4 * PIXELS_PER_JOB).for_each(|job| {
            for px in job.chunks_exact_mut(4) {
                for c in &mut px[..3] {
                    let v = match curve {
                        Some(curve) => curve.map(*c),
                        None => c.max(0.0),
                    };
                    *c = gamma_correct(v);
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn inverse_gamma_correct(v: Float) -> Float {
        if v <= 0.04045 {
            v / 12.92
        } else {
            ((v + 0.055) / 1.055).powf(2.4)
        }
    }

    #[test]
    fn test_gamma_round_trip() {
        for &v in &[0.0, 0.002, 0.18, 0.5, 1.0] {
            assert_abs_diff_eq!(inverse_gamma_correct(gamma_correct(v)), v, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_profiles_put_default_first() {
        let profiles = ColorProfiles::from_processor(&ToneMapper::default());
        assert_eq!(profiles.names()[0], DEFAULT_PROFILE_NAME);
        assert_eq!(profiles.names()[1], "Reinhard");
        assert_eq!(profiles.len(), 4);
    }

    #[test]
    fn test_profile_to_look_index() {
        let count = ColorProfiles::from_processor(&ToneMapper::default()).len();
        assert_eq!(look_for_profile(0, count), None);
        assert_eq!(look_for_profile(1, count), Some(0));
        assert_eq!(look_for_profile(3, count), Some(2));
        assert_eq!(look_for_profile(4, count), None);
    }

    #[test]
    fn test_curves_are_monotonic_and_bounded() {
        for &curve in ToneCurve::ALL.iter() {
            let mut last = curve.map(0.0);
            for i in 1..200 {
                let v = curve.map(i as Float * 0.05);
                assert!(v >= last, "{:?} not monotonic at {}", curve, i);
                assert!(v <= 1.0 + 1e-4, "{:?} above white at {}", curve, i);
                last = v;
            }
        }
    }

    #[test]
    fn test_apply_leaves_alpha() {
        let mapper = ToneMapper::default();
        let mut px = vec![0.5, 1.0, 4.0, 0.25];
        assert!(mapper.apply(Some(0), &mut px));
        assert_eq!(px[3], 0.25);
        assert_abs_diff_eq!(px[0], gamma_correct(0.5 / 1.5), epsilon = 1e-6);
    }

    #[test]
    fn test_apply_unknown_look_fails() {
        let mapper = ToneMapper::default();
        let mut px = vec![0.5, 0.5, 0.5, 1.0];
        assert!(!mapper.apply(Some(7), &mut px));
        assert_eq!(px, vec![0.5, 0.5, 0.5, 1.0]);
    }
}

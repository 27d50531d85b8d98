//! Render buffers and their conversion into something a window can show.

use ::image::imageops::flip_vertical_in_place;
use ::image::{ImageBuffer, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::color::{look_for_profile, simple_gamma, ColorProcessor};
use crate::engine::{EngineImage, PixelFormat};
use crate::Float;

/// Linear-light RGBA render output, 4 floats per pixel, rows in engine order
/// (bottom-up).
#[derive(Clone, Debug, PartialEq)]
pub struct RenderImage {
    width: u32,
    height: u32,
    pixels: Vec<Float>,
    has_alpha: bool,
}

impl RenderImage {
    pub fn new(width: u32, height: u32, pixels: Vec<Float>, has_alpha: bool) -> Self {
        Self {
            width,
            height,
            pixels,
            has_alpha,
        }
    }

    /// Copies an image handed over by the engine. Returns `None` for anything that is
    /// not a tightly packed float RGBA buffer of the advertised size.
    pub fn from_engine(image: &EngineImage<'_>, has_alpha: bool) -> Option<Self> {
        let len = (image.width as usize)
            .checked_mul(image.height as usize)
            .and_then(|n| n.checked_mul(4))?;
        let valid = image.format == PixelFormat::FloatRgba
            && image.width > 0
            && image.height > 0
            && u64::from(image.stride_bytes) == u64::from(image.width) * 16
            && image.pixels.len() >= len;

        if !valid {
            return None;
        }
        Some(Self::new(image.width, image.height, image.pixels[..len].to_vec(), has_alpha))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[Float] {
        &self.pixels
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }
}

/// 8-bit BGRA pixels, top row first, ready for a display surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DisplayImage {
    /// BGRA bytes of the pixel at `(x, y)`, with `y = 0` at the top. `None` outside
    /// the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        let px = self.pixels.get(i..i + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            let [b, g, r, a] = self.pixel(x, y).unwrap_or_default();
            Rgba([r, g, b, a])
        })
    }
}

/// What to do with the alpha channel of renders made with a transparent background.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphaPolicy {
    /// Blend over opaque white, the way the preview has always shown transparent
    /// renders.
    CompositeOverWhite,
    /// Keep per-pixel alpha and let the surface deal with it.
    Preserve,
}

impl Default for AlphaPolicy {
    fn default() -> Self {
        AlphaPolicy::CompositeOverWhite
    }
}

/// Converts a render image into a display image.
///
/// `color_profile_index` 0 is the default sRGB transform, `n >= 1` is look `n - 1` of
/// `processor`. `exposure` is in stops. Returns `None` if the image is empty or its
/// buffer does not hold exactly `width * height` RGBA pixels.
pub fn convert(
    image: &RenderImage,
    color_profile_index: usize,
    exposure: Float,
    processor: &dyn ColorProcessor,
    alpha_policy: AlphaPolicy,
) -> Option<DisplayImage> {
    let (w, h) = (image.width, image.height);
    if w == 0 || h == 0 || image.pixels.len() != w as usize * h as usize * 4 {
        return None;
    }

    let _span = tracing::trace_span!("convert", w, h, color_profile_index).entered();

    let mut linear = image.pixels.clone();
    if exposure != 0.0 {
        let scale = Float::powf(2.0, exposure);
        linear.par_chunks_mut(4 * w as usize).for_each(|row| {
            for px in row.chunks_exact_mut(4) {
                px[0] *= scale;
                px[1] *= scale;
                px[2] *= scale;
            }
        });
    }

    let look = look_for_profile(color_profile_index, processor.looks().len() + 1);
    if !processor.apply(look, &mut linear) {
        if look.is_none() {
            linear.par_chunks_mut(4 * w as usize).for_each(|row| {
                for px in row.chunks_exact_mut(4) {
                    for c in &mut px[..3] {
                        *c = simple_gamma(*c);
                    }
                }
            });
        } else {
            tracing::debug!("look {:?} could not be applied, showing linear values", look);
        }
    }

    let mut display = ImageBuffer::<Rgba<Float>, Vec<Float>>::from_raw(w, h, linear)?;
    flip_vertical_in_place(&mut display);

    let has_alpha = image.has_alpha;
    let mut pixels = vec![0u8; w as usize * h as usize * 4];
    pixels
        .par_chunks_mut(4)
        .zip(display.as_raw().par_chunks(4))
        .for_each(|(out, px)| {
            let a = px[3].clamp(0.0, 1.0);
            let (rgb, alpha) = match (has_alpha, alpha_policy) {
                (true, AlphaPolicy::CompositeOverWhite) => {
                    let over_white = |c: Float| c.clamp(0.0, 1.0) * a + (1.0 - a);
                    ([over_white(px[0]), over_white(px[1]), over_white(px[2])], 255)
                }
                (true, AlphaPolicy::Preserve) => ([px[0], px[1], px[2]], to_u8(a)),
                (false, _) => ([px[0], px[1], px[2]], 255),
            };
            out[0] = to_u8(rgb[2]);
            out[1] = to_u8(rgb[1]);
            out[2] = to_u8(rgb[0]);
            out[3] = alpha;
        });

    Some(DisplayImage {
        width: w,
        height: h,
        pixels,
    })
}

fn to_u8(v: Float) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

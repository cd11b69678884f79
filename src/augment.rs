//! Augmentation pipeline
//!
//! Deterministic image transforms applied before feature extraction. The
//! fixed set is `original`, `mirror_horizontal`, `mirror_vertical` and
//! `gaussian_blur`; `random_combo_k` entries derive their parameters from a
//! seeded stream over `(image_path, augmentation_name, width, height)`, so
//! re-ingesting the same file reproduces the same transforms. Output is
//! always resized back to the source dimensions.

use image::{imageops, DynamicImage, GenericImageView, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::{Digest, Sha1};

use crate::error::{EngineError, Result};
use crate::raster::{hsv_to_rgb, rgb_to_hsv};

pub const AUG_ORIGINAL: &str = "original";
pub const AUG_MIRROR_H: &str = "mirror_horizontal";
pub const AUG_MIRROR_V: &str = "mirror_vertical";
pub const AUG_BLUR: &str = "gaussian_blur";

/// Sigma for the fixed `gaussian_blur` augmentation.
const FIXED_BLUR_SIGMA: f32 = 1.2;

/// The ordered augmentation list: the fixed four plus `combo_count`
/// seeded combos.
pub fn augmentation_names(combo_count: u32) -> Vec<String> {
    let mut names = vec![
        AUG_ORIGINAL.to_string(),
        AUG_MIRROR_H.to_string(),
        AUG_MIRROR_V.to_string(),
        AUG_BLUR.to_string(),
    ];
    for k in 1..=combo_count {
        names.push(format!("random_combo_{k}"));
    }
    names
}

// ============================================================================
// Seeded Combo Parameters
// ============================================================================

/// Parameters drawn for one `random_combo_k` application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComboParams {
    /// Central crop ratio in [0.82, 0.97].
    pub crop_ratio: f64,
    /// Rotation in degrees, [-6, +6].
    pub rotation_deg: f64,
    /// Saturation multiplier in [0.85, 1.15].
    pub saturation: f64,
    /// Brightness multiplier in [0.9, 1.1].
    pub brightness: f64,
    /// Hue shift rounded to an integer degree.
    pub hue_shift_deg: i32,
    /// Extra blur sigma in [0.4, 1.0], applied half the time.
    pub blur_sigma: Option<f64>,
}

impl ComboParams {
    /// Derive the parameter set from the seed tuple. Identical inputs yield
    /// identical parameters on any process.
    pub fn derive(image_path: &str, augmentation: &str, width: u32, height: u32) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("{image_path}|{augmentation}|{width}|{height}").as_bytes());
        let digest = hasher.finalize();
        let seed = u64::from_le_bytes(digest[..8].try_into().expect("sha1 digest is 20 bytes"));
        let mut rng = StdRng::seed_from_u64(seed);

        ComboParams {
            crop_ratio: rng.gen_range(0.82..=0.97),
            rotation_deg: rng.gen_range(-6.0..=6.0),
            saturation: rng.gen_range(0.85..=1.15),
            brightness: rng.gen_range(0.9..=1.1),
            hue_shift_deg: rng.gen_range(-180.0..=180.0_f64).round() as i32,
            blur_sigma: if rng.gen_bool(0.5) {
                Some(rng.gen_range(0.4..=1.0))
            } else {
                None
            },
        }
    }
}

// ============================================================================
// Application
// ============================================================================

/// Apply the named augmentation. The result always has the source
/// dimensions. Unknown names are fatal at job scope.
pub fn apply_augmentation(
    img: &DynamicImage,
    name: &str,
    image_path: &str,
) -> Result<DynamicImage> {
    match name {
        AUG_ORIGINAL => Ok(img.clone()),
        AUG_MIRROR_H => Ok(img.fliph()),
        AUG_MIRROR_V => Ok(img.flipv()),
        AUG_BLUR => Ok(img.blur(FIXED_BLUR_SIGMA)),
        _ if name.starts_with("random_combo_") => {
            let params = ComboParams::derive(image_path, name, img.width(), img.height());
            Ok(apply_combo(img, &params))
        }
        _ => Err(EngineError::UnknownAugmentation(name.to_string())),
    }
}

fn apply_combo(img: &DynamicImage, p: &ComboParams) -> DynamicImage {
    let (w, h) = (img.width(), img.height());

    // Centered crop at the drawn ratio.
    let cw = ((w as f64 * p.crop_ratio).round() as u32).max(1);
    let ch = ((h as f64 * p.crop_ratio).round() as u32).max(1);
    let cx = (w - cw) / 2;
    let cy = (h - ch) / 2;
    let mut rgb = img.crop_imm(cx, cy, cw, ch).to_rgb8();

    if p.rotation_deg.abs() > 1e-9 {
        rgb = rotate_bilinear(&rgb, p.rotation_deg);
    }

    rgb = modulate(&rgb, p.saturation, p.brightness);

    let mut out = DynamicImage::ImageRgb8(rgb);
    if p.hue_shift_deg != 0 {
        out = out.huerotate(p.hue_shift_deg);
    }
    if let Some(sigma) = p.blur_sigma {
        out = out.blur(sigma as f32);
    }

    // Back to the source dimensions so descriptor geometry stays comparable.
    out.resize_exact(w, h, imageops::FilterType::Triangle)
}

/// Per-pixel saturation/brightness scaling through HSV.
fn modulate(img: &RgbImage, saturation: f64, brightness: f64) -> RgbImage {
    let mut out = img.clone();
    for pixel in out.pixels_mut() {
        let [r, g, b] = pixel.0;
        let (h, s, v) = rgb_to_hsv(r as f64, g as f64, b as f64);
        let (nr, ng, nb) = hsv_to_rgb(
            h,
            (s * saturation).clamp(0.0, 100.0),
            (v * brightness).clamp(0.0, 100.0),
        );
        *pixel = Rgb([nr.round() as u8, ng.round() as u8, nb.round() as u8]);
    }
    out
}

/// Rotate about the center with bilinear sampling, clamping source reads to
/// the image edge. Arbitrary small-angle rotation is not offered by the
/// raster crate, so the sampler lives here.
fn rotate_bilinear(img: &RgbImage, degrees: f64) -> RgbImage {
    let (w, h) = img.dimensions();
    let theta = degrees.to_radians();
    let (sin_t, cos_t) = theta.sin_cos();
    let cx = (w as f64 - 1.0) / 2.0;
    let cy = (h as f64 - 1.0) / 2.0;

    let mut out = RgbImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            // Inverse-map the destination pixel into the source.
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let sx = cos_t * dx + sin_t * dy + cx;
            let sy = -sin_t * dx + cos_t * dy + cy;
            out.put_pixel(x, y, sample_bilinear(img, sx, sy));
        }
    }
    out
}

fn sample_bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = img.dimensions();
    let clamp_px = |v: i64, max: u32| v.clamp(0, max as i64 - 1) as u32;

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = img.get_pixel(clamp_px(x0, w), clamp_px(y0, h)).0;
    let p10 = img.get_pixel(clamp_px(x0 + 1, w), clamp_px(y0, h)).0;
    let p01 = img.get_pixel(clamp_px(x0, w), clamp_px(y0 + 1, h)).0;
    let p11 = img.get_pixel(clamp_px(x0 + 1, w), clamp_px(y0 + 1, h)).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round() as u8;
    }
    Rgb(out)
}

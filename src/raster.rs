//! Raster statistics
//!
//! Per-rectangle channel statistics over interleaved RGB pixels. All
//! accumulation happens in `f64`; variance is clamped at zero before the
//! square root to guard floating-point underflow.

use image::RgbImage;

/// Aggregate statistics for one rectangle of an image.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionStats {
    pub r: f64,
    pub g: f64,
    pub b: f64,
    /// Hue in degrees, [0, 360).
    pub hue: f64,
    /// Saturation, [0, 100].
    pub saturation: f64,
    /// Value, [0, 100].
    pub value: f64,
    /// Rec. 709 luminance of the mean color, [0, 255].
    pub luminance: f64,
    /// Pooled per-channel standard deviation.
    pub std_dev: f64,
}

/// Axis-aligned pixel rectangle, `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }
}

/// Compute mean R/G/B, derived HSV, luminance and pooled std-dev for the
/// rectangle. The rectangle must lie within the image bounds; an empty
/// rectangle yields the zeroed result.
pub fn region_stats(img: &RgbImage, rect: PixelRect) -> RegionStats {
    if rect.is_empty() || rect.x1 > img.width() || rect.y1 > img.height() {
        return RegionStats::default();
    }

    let mut sum = [0.0f64; 3];
    let mut sum_sq = [0.0f64; 3];
    let n = (rect.width() as f64) * (rect.height() as f64);

    for y in rect.y0..rect.y1 {
        for x in rect.x0..rect.x1 {
            let p = img.get_pixel(x, y).0;
            for c in 0..3 {
                let v = p[c] as f64;
                sum[c] += v;
                sum_sq[c] += v * v;
            }
        }
    }

    let mean = [sum[0] / n, sum[1] / n, sum[2] / n];
    let mut var_total = 0.0;
    for c in 0..3 {
        let var = (sum_sq[c] / n - mean[c] * mean[c]).max(0.0);
        var_total += var;
    }
    let std_dev = (var_total / 3.0).sqrt();

    let (hue, saturation, value) = rgb_to_hsv(mean[0], mean[1], mean[2]);
    let luminance = 0.2126 * mean[0] + 0.7152 * mean[1] + 0.0722 * mean[2];

    RegionStats {
        r: mean[0],
        g: mean[1],
        b: mean[2],
        hue,
        saturation,
        value,
        luminance,
        std_dev,
    }
}

/// Standard RGB→HSV on [0,255] inputs. Hue in [0,360), saturation and value
/// in [0,100].
pub fn rgb_to_hsv(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let r = r / 255.0;
    let g = g / 255.0;
    let b = b / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta <= f64::EPSILON {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let saturation = if max <= f64::EPSILON { 0.0 } else { delta / max };

    (hue.rem_euclid(360.0), saturation * 100.0, max * 100.0)
}

/// Inverse of `rgb_to_hsv`; used by the augmentation pipeline for
/// saturation scaling. Inputs h∈[0,360), s,v∈[0,100]; outputs [0,255].
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (f64, f64, f64) {
    let s = (s / 100.0).clamp(0.0, 1.0);
    let v = (v / 100.0).clamp(0.0, 1.0);
    let h = h.rem_euclid(360.0) / 60.0;

    let c = v * s;
    let x = c * (1.0 - (h.rem_euclid(2.0) - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    ((r + m) * 255.0, (g + m) * 255.0, (b + m) * 255.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(w: u32, h: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb(color))
    }

    #[test]
    fn test_solid_region() {
        let img = solid(10, 10, [200, 100, 50]);
        let stats = region_stats(
            &img,
            PixelRect {
                x0: 2,
                y0: 2,
                x1: 8,
                y1: 8,
            },
        );
        assert!((stats.r - 200.0).abs() < 1e-9);
        assert!((stats.g - 100.0).abs() < 1e-9);
        assert!((stats.b - 50.0).abs() < 1e-9);
        assert!(stats.std_dev.abs() < 1e-9);
        let expected_lum = 0.2126 * 200.0 + 0.7152 * 100.0 + 0.0722 * 50.0;
        assert!((stats.luminance - expected_lum).abs() < 1e-9);
    }

    #[test]
    fn test_empty_rect_is_zeroed() {
        let img = solid(4, 4, [255, 255, 255]);
        let stats = region_stats(
            &img,
            PixelRect {
                x0: 2,
                y0: 2,
                x1: 2,
                y1: 3,
            },
        );
        assert_eq!(stats, RegionStats::default());
    }

    #[test]
    fn test_out_of_bounds_is_zeroed() {
        let img = solid(4, 4, [10, 10, 10]);
        let stats = region_stats(
            &img,
            PixelRect {
                x0: 0,
                y0: 0,
                x1: 5,
                y1: 4,
            },
        );
        assert_eq!(stats, RegionStats::default());
    }

    #[test]
    fn test_std_dev_checkerboard() {
        let mut img = solid(2, 1, [0, 0, 0]);
        img.put_pixel(1, 0, Rgb([255, 255, 255]));
        let stats = region_stats(
            &img,
            PixelRect {
                x0: 0,
                y0: 0,
                x1: 2,
                y1: 1,
            },
        );
        // Each channel: mean 127.5, deviation 127.5.
        assert!((stats.std_dev - 127.5).abs() < 1e-9);
    }

    #[test]
    fn test_hsv_primaries() {
        let (h, s, v) = rgb_to_hsv(255.0, 0.0, 0.0);
        assert!(h.abs() < 1e-9);
        assert!((s - 100.0).abs() < 1e-9);
        assert!((v - 100.0).abs() < 1e-9);

        let (h, _, _) = rgb_to_hsv(0.0, 255.0, 0.0);
        assert!((h - 120.0).abs() < 1e-9);

        let (h, _, _) = rgb_to_hsv(0.0, 0.0, 255.0);
        assert!((h - 240.0).abs() < 1e-9);
    }

    #[test]
    fn test_hsv_round_trip() {
        for rgb in [[12.0, 200.0, 90.0], [255.0, 255.0, 255.0], [0.0, 0.0, 0.0]] {
            let (h, s, v) = rgb_to_hsv(rgb[0], rgb[1], rgb[2]);
            let (r, g, b) = hsv_to_rgb(h, s, v);
            assert!((r - rgb[0]).abs() < 0.5);
            assert!((g - rgb[1]).abs() < 0.5);
            assert!((b - rgb[2]).abs() < 0.5);
        }
    }
}

//! Vector extractor
//!
//! Realizes a descriptor on a concrete image: applies the augmentation,
//! places the anchor and neighbor rectangles, and measures the normalized
//! signed difference of the chosen channel statistic. Deterministic given
//! identical inputs and raster-library behavior.

use image::DynamicImage;

use crate::augment;
use crate::descriptor::{Channel, Descriptor};
use crate::error::Result;
use crate::raster::{region_stats, RegionStats};
use crate::sample::{place_in_image, spec_for_descriptor};

/// One realized measurement: the probe payload for this descriptor on this
/// image.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Normalized signed difference of anchor and neighbor statistics.
    pub value: f64,
    /// Span, fractional of the shorter dimension.
    pub size: f64,
    /// Adjusted neighbor offset after in-bounds clamping, span units.
    pub rel_x: f64,
    pub rel_y: f64,
    pub descriptor: Descriptor,
    pub descriptor_key: String,
}

/// Pick the descriptor's channel statistic out of a stats block.
pub fn channel_stat(stats: &RegionStats, channel: Channel) -> f64 {
    match channel {
        Channel::Hue => stats.hue,
        Channel::Saturation => stats.saturation,
        Channel::Value => stats.value,
        Channel::Luminance => stats.luminance,
        Channel::StdDev => stats.std_dev,
    }
}

/// Measure a descriptor on an already-augmented raster. `None` when the
/// geometry cannot be realized on this image.
pub fn measure_on_raster(img: &image::RgbImage, d: &Descriptor) -> Option<Measurement> {
    let d = d.canonicalize();
    let placed = place_in_image(&d, img.width(), img.height())?;

    let anchor_stats = region_stats(img, placed.anchor);
    let neighbor_stats = region_stats(img, placed.neighbor);

    let delta = channel_stat(&anchor_stats, d.channel) - channel_stat(&neighbor_stats, d.channel);
    let value = delta / d.channel.range();

    let spec = spec_for_descriptor(&d);
    Some(Measurement {
        value,
        size: d.span,
        rel_x: placed.rel_x,
        rel_y: placed.rel_y,
        descriptor_key: spec.descriptor_key,
        descriptor: d,
    })
}

/// Measure every channel variant of one geometry in a single pass. Both
/// rectangle statistics are computed once; each channel reads its own
/// normalized difference out of them. Ingestion stores all variants so a
/// session can later walk the channel dimensions of an asked probe.
pub fn measure_channels_on_raster(img: &image::RgbImage, d: &Descriptor) -> Vec<Measurement> {
    let d = d.canonicalize();
    let Some(placed) = place_in_image(&d, img.width(), img.height()) else {
        return Vec::new();
    };

    let anchor_stats = region_stats(img, placed.anchor);
    let neighbor_stats = region_stats(img, placed.neighbor);

    crate::descriptor::CHANNEL_DIMENSIONS
        .iter()
        .map(|&channel| {
            let variant = d.with_channel(channel);
            let delta =
                channel_stat(&anchor_stats, channel) - channel_stat(&neighbor_stats, channel);
            let spec = spec_for_descriptor(&variant);
            Measurement {
                value: delta / channel.range(),
                size: variant.span,
                rel_x: placed.rel_x,
                rel_y: placed.rel_y,
                descriptor_key: spec.descriptor_key,
                descriptor: variant,
            }
        })
        .collect()
}

/// Decode-once entry point: applies the descriptor's augmentation to the
/// decoded image, then measures. Unknown augmentations are job-fatal.
pub fn extract_measurement(
    img: &DynamicImage,
    d: &Descriptor,
    image_path: &str,
) -> Result<Option<Measurement>> {
    let augmented = if d.augmentation == augment::AUG_ORIGINAL {
        img.to_rgb8()
    } else {
        augment::apply_augmentation(img, &d.augmentation, image_path)?.to_rgb8()
    };
    Ok(measure_on_raster(&augmented, d))
}

//! Sample generator
//!
//! Maps a `sample_id` to reproducible descriptor geometry. The stream is
//! seeded from a SHA-1 digest of the id so two processes always agree.
//! The quantization constants below are part of the wire contract: ingest
//! and query must re-derive identical integer lookup keys.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::augment;
use crate::descriptor::{Channel, Descriptor, CHANNEL_DIMENSIONS, FAMILY_DELTA};
use crate::raster::PixelRect;

// ============================================================================
// Quantization Constants (wire contract)
// ============================================================================

pub const ANCHOR_SCALE: f64 = 1000.0;
pub const SPAN_SCALE: f64 = 1000.0;
/// Permitted drift of stored vs probed relative offsets, in span units.
pub const OFFSET_TOLERANCE: f64 = 0.35;
pub const SAMPLES_PER_AUGMENTATION: u64 = 1000;
/// Span bounds, fractional of the shorter image dimension.
pub const MIN_SPAN: f64 = 0.02;
pub const MAX_SPAN: f64 = 0.25;
/// Maximum neighbor displacement, in span units.
pub const MAX_OFFSET: f64 = 3.0;

// ============================================================================
// Deterministic Parameter Stream
// ============================================================================

/// Geometry drawn for one sample ordinal, before augmentation assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleParams {
    pub span: f64,
    pub anchor_u: f64,
    pub anchor_v: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub channel: Channel,
}

fn seed_for(sample_id: u64) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(format!("sample:{sample_id}").as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("sha1 digest is 20 bytes"))
}

/// Pure function of the sample id and the constants above.
pub fn sample_params(sample_id: u64) -> SampleParams {
    let mut rng = StdRng::seed_from_u64(seed_for(sample_id));

    let span = rng.gen_range(MIN_SPAN..=MAX_SPAN);
    let anchor_u = rng.gen_range(0.0..=1.0);
    let anchor_v = rng.gen_range(0.0..=1.0);
    let angle = rng.gen_range(0.0..std::f64::consts::TAU);
    let magnitude = rng.gen_range(0.0..=MAX_OFFSET);
    let channel = CHANNEL_DIMENSIONS[rng.gen_range(0..CHANNEL_DIMENSIONS.len())];

    SampleParams {
        span,
        anchor_u,
        anchor_v,
        offset_x: angle.cos() * magnitude,
        offset_y: angle.sin() * magnitude,
        channel,
    }
}

/// Build the full descriptor for a sample id. The augmentation index is
/// `sample_id / SAMPLES_PER_AUGMENTATION`, wrapped over the augmentation
/// list so the function stays total.
pub fn descriptor_for_sample(sample_id: u64, combo_count: u32) -> Descriptor {
    let names = augment::augmentation_names(combo_count);
    let aug_index = (sample_id / SAMPLES_PER_AUGMENTATION) as usize % names.len();
    let p = sample_params(sample_id);

    Descriptor {
        family: FAMILY_DELTA.into(),
        channel: p.channel,
        augmentation: names[aug_index].clone(),
        sample_id,
        anchor_u: p.anchor_u,
        anchor_v: p.anchor_v,
        span: p.span,
        offset_x: p.offset_x,
        offset_y: p.offset_y,
    }
    .canonicalize()
}

// ============================================================================
// Integer Lookup Keys
// ============================================================================

/// A descriptor plus the quantized lookup key it resolves to. This is what
/// the server hands a client when it requests a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    pub descriptor: Descriptor,
    pub descriptor_key: String,
    pub resolution_level: i64,
    pub pos_x: i64,
    pub pos_y: i64,
}

pub fn resolution_level_for_span(span: f64) -> i64 {
    ((span * SPAN_SCALE).round() as i64).clamp(0, 255)
}

pub fn quantize_anchor(anchor: f64) -> i64 {
    (anchor * ANCHOR_SCALE).round() as i64
}

/// Re-derive the integer lookup key for a descriptor.
pub fn spec_for_descriptor(d: &Descriptor) -> ProbeSpec {
    let c = d.canonicalize();
    ProbeSpec {
        descriptor_key: c.hash(),
        resolution_level: resolution_level_for_span(c.span),
        pos_x: quantize_anchor(c.anchor_u),
        pos_y: quantize_anchor(c.anchor_v),
        descriptor: c,
    }
}

// ============================================================================
// Image Placement
// ============================================================================

/// Anchor and neighbor rectangles realized on a concrete image, plus the
/// back-computed offset after clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedRects {
    pub anchor: PixelRect,
    pub neighbor: PixelRect,
    /// Adjusted neighbor offset in span units after clamping.
    pub rel_x: f64,
    pub rel_y: f64,
    /// Rectangle side in pixels.
    pub side: u32,
}

/// Map normalized geometry into pixel space. The anchor is positioned with
/// a margin proportional to the span so its rectangle is always interior;
/// the neighbor is clamped inside bounds and the offset re-derived from the
/// clamped position. Returns `None` when the span cannot be realized.
pub fn place_in_image(d: &Descriptor, width: u32, height: u32) -> Option<PlacedRects> {
    let shorter = width.min(height);
    if shorter == 0 {
        return None;
    }
    let side = (d.span * shorter as f64).round() as i64;
    if side < 1 || side as u32 > shorter {
        return None;
    }
    let side_f = side as f64;

    let max_x = width as f64 - side_f;
    let max_y = height as f64 - side_f;
    if max_x < 0.0 || max_y < 0.0 {
        return None;
    }

    let ax = (d.anchor_u.clamp(0.0, 1.0) * max_x).floor();
    let ay = (d.anchor_v.clamp(0.0, 1.0) * max_y).floor();

    let nx = (ax + d.offset_x * side_f).clamp(0.0, max_x).floor();
    let ny = (ay + d.offset_y * side_f).clamp(0.0, max_y).floor();

    let rel_x = (nx - ax) / side_f;
    let rel_y = (ny - ay) / side_f;

    let rect = |x: f64, y: f64| PixelRect {
        x0: x as u32,
        y0: y as u32,
        x1: x as u32 + side as u32,
        y1: y as u32 + side as u32,
    };

    Some(PlacedRects {
        anchor: rect(ax, ay),
        neighbor: rect(nx, ny),
        rel_x,
        rel_y,
        side: side as u32,
    })
}

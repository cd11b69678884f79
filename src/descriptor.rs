//! Descriptor model
//!
//! A descriptor is a geometric measurement recipe: a channel statistic
//! measured over two displaced rectangles of an augmented image. The
//! canonical form is the field-sorted `key=value` encoding with every
//! numeric field rounded to 6 decimal places; the descriptor hash is the
//! SHA-1 hex digest of that encoding and is stable across processes.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Descriptor family for two-rectangle signed differences.
pub const FAMILY_DELTA: &str = "delta";

/// Channel statistic measured inside each rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[serde(rename = "h")]
    Hue,
    #[serde(rename = "s")]
    Saturation,
    #[serde(rename = "v")]
    Value,
    Luminance,
    #[serde(rename = "stddev")]
    StdDev,
}

/// Probe dialog order; also the canonical wire tokens.
pub const CHANNEL_DIMENSIONS: [Channel; 5] = [
    Channel::Hue,
    Channel::Saturation,
    Channel::Value,
    Channel::Luminance,
    Channel::StdDev,
];

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Hue => "h",
            Channel::Saturation => "s",
            Channel::Value => "v",
            Channel::Luminance => "luminance",
            Channel::StdDev => "stddev",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "h" => Some(Channel::Hue),
            "s" => Some(Channel::Saturation),
            "v" => Some(Channel::Value),
            "luminance" => Some(Channel::Luminance),
            "stddev" => Some(Channel::StdDev),
            _ => None,
        }
    }

    /// Natural range divisor used to normalize measured differences.
    pub fn range(&self) -> f64 {
        match self {
            Channel::Hue => 360.0,
            Channel::Saturation | Channel::Value => 100.0,
            Channel::Luminance => 255.0,
            Channel::StdDev => 128.0,
        }
    }
}

/// An immutable measurement recipe. Geometry is expressed in normalized
/// image coordinates: `span` is fractional of the shorter image dimension,
/// the neighbor rectangle is displaced by `(offset_x, offset_y)` span units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub family: String,
    pub channel: Channel,
    pub augmentation: String,
    pub sample_id: u64,
    pub anchor_u: f64,
    pub anchor_v: f64,
    pub span: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

/// Round to 6 decimal places; applied to every numeric field before hashing.
pub fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

fn fmt6(x: f64) -> String {
    format!("{:.6}", round6(x))
}

impl Descriptor {
    /// Return a copy with every numeric field rounded to 6 decimals.
    /// Idempotent: canonicalizing twice is the same as once.
    pub fn canonicalize(&self) -> Descriptor {
        Descriptor {
            family: self.family.clone(),
            channel: self.channel,
            augmentation: self.augmentation.clone(),
            sample_id: self.sample_id,
            anchor_u: round6(self.anchor_u),
            anchor_v: round6(self.anchor_v),
            span: round6(self.span),
            offset_x: round6(self.offset_x),
            offset_y: round6(self.offset_y),
        }
    }

    /// Field-sorted canonical serialization.
    pub fn canonical_string(&self) -> String {
        let c = self.canonicalize();
        format!(
            "anchor_u={};anchor_v={};augmentation={};channel={};family={};offset_x={};offset_y={};sample_id={};span={}",
            fmt6(c.anchor_u),
            fmt6(c.anchor_v),
            c.augmentation,
            c.channel.as_str(),
            c.family,
            fmt6(c.offset_x),
            fmt6(c.offset_y),
            c.sample_id,
            fmt6(c.span),
        )
    }

    /// 40-hex-char SHA-1 digest of the canonical serialization.
    pub fn hash(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.canonical_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Reverse the canonical serialization. Returns `None` on malformed
    /// input: missing fields, unknown channel, unparseable numbers.
    pub fn parse(blob: &str) -> Option<Descriptor> {
        let mut family = None;
        let mut channel = None;
        let mut augmentation = None;
        let mut sample_id = None;
        let mut anchor_u = None;
        let mut anchor_v = None;
        let mut span = None;
        let mut offset_x = None;
        let mut offset_y = None;

        for part in blob.split(';') {
            let (key, value) = part.split_once('=')?;
            match key {
                "family" => family = Some(value.to_string()),
                "channel" => channel = Channel::parse(value),
                "augmentation" => augmentation = Some(value.to_string()),
                "sample_id" => sample_id = value.parse::<u64>().ok(),
                "anchor_u" => anchor_u = value.parse::<f64>().ok(),
                "anchor_v" => anchor_v = value.parse::<f64>().ok(),
                "span" => span = value.parse::<f64>().ok(),
                "offset_x" => offset_x = value.parse::<f64>().ok(),
                "offset_y" => offset_y = value.parse::<f64>().ok(),
                _ => return None,
            }
        }

        Some(Descriptor {
            family: family?,
            channel: channel?,
            augmentation: augmentation?,
            sample_id: sample_id?,
            anchor_u: anchor_u?,
            anchor_v: anchor_v?,
            span: span?,
            offset_x: offset_x?,
            offset_y: offset_y?,
        })
    }

    /// Same geometry, different channel. Used by the session engine to walk
    /// the channel dimensions of an already-asked probe.
    pub fn with_channel(&self, channel: Channel) -> Descriptor {
        let mut d = self.clone();
        d.channel = channel;
        d
    }
}

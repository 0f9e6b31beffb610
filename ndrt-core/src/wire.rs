//! Wire codec: MessagePack surface/status maps in, JSON status records out.
//!
//! Inbound payloads are self-describing maps. Unknown keys are skipped and
//! optional keys fall back to defaults; a key with the wrong type or a
//! truncated buffer is `Malformed`, a missing required key is `SchemaMismatch`.

use serde::Deserialize;

use crate::protocol::{
    FixationSample, GazeSample, StatusRecord, StatusUpdate, SurfaceFrame, VehicleStatus,
    INVALID_POSITION,
};

/// chrono format of the outbound timestamp (`DD/MM/YYYY HH:MM:SS.ffffff`).
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S%.6f";

/// Error decoding an inbound payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("missing required field `{field}`")]
    SchemaMismatch { field: &'static str },
}

impl From<rmp_serde::decode::Error> for DecodeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

/// A record that can be decoded from one whole message payload.
pub trait Decode: Sized {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;
}

/// Decode one payload into `T`.
pub fn decode<T: Decode>(bytes: &[u8]) -> Result<T, DecodeError> {
    T::decode(bytes)
}

/// Encode an outbound status record as a single-line JSON object.
pub fn encode(record: &StatusRecord) -> Vec<u8> {
    serde_json::json!({
        "from": record.from,
        "timestamp": record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        "vehicle_status": record.vehicle_status.as_wire_str(),
    })
    .to_string()
    .into_bytes()
}

#[derive(Deserialize)]
struct RawSurfaceFrame {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    surf_to_img_trans: Vec<Vec<f64>>,
    #[serde(default)]
    img_to_surf_trans: Vec<Vec<f64>>,
    #[serde(default)]
    surf_to_dist_img_trans: Vec<Vec<f64>>,
    #[serde(default)]
    dist_img_to_surf_trans: Vec<Vec<f64>>,
    #[serde(default)]
    gaze_on_surfaces: Option<Vec<RawSurfaceDatum>>,
    #[serde(default)]
    fixations_on_surfaces: Vec<RawSurfaceDatum>,
    #[serde(default)]
    timestamp: Option<f64>,
}

/// Shared shape of `gaze_on_surfaces` and `fixations_on_surfaces` entries.
#[derive(Deserialize)]
struct RawSurfaceDatum {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    norm_pos: Option<Vec<f64>>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    on_surf: Option<bool>,
    #[serde(default)]
    base_data: Option<(String, f64)>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    dispersion: f64,
}

impl RawSurfaceDatum {
    fn into_gaze(self, require_on_surf: bool) -> Result<GazeSample, DecodeError> {
        let norm_pos = self
            .norm_pos
            .ok_or(DecodeError::SchemaMismatch { field: "norm_pos" })?;
        let timestamp = finite_timestamp(self.timestamp)?;
        let on_target = match self.on_surf {
            Some(v) => v,
            None if require_on_surf => {
                return Err(DecodeError::SchemaMismatch { field: "on_surf" })
            }
            None => false,
        };
        let (base_topic, base_timestamp) = self.base_data.unwrap_or_default();
        Ok(GazeSample {
            topic: self.topic,
            normalized_position: normalized_position(&norm_pos),
            confidence: self.confidence,
            on_target,
            base_topic,
            base_timestamp,
            timestamp,
        })
    }
}

fn finite_timestamp(ts: Option<f64>) -> Result<f64, DecodeError> {
    match ts {
        None => Err(DecodeError::SchemaMismatch { field: "timestamp" }),
        Some(t) if !t.is_finite() => Err(DecodeError::Malformed(format!(
            "non-finite timestamp {}",
            t
        ))),
        Some(t) => Ok(t),
    }
}

fn normalized_position(norm_pos: &[f64]) -> [f64; 2] {
    match norm_pos {
        [x, y] if x.is_finite() && y.is_finite() => [*x, *y],
        _ => INVALID_POSITION,
    }
}

impl Decode for SurfaceFrame {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawSurfaceFrame = rmp_serde::from_slice(bytes)?;
        let gaze = raw.gaze_on_surfaces.ok_or(DecodeError::SchemaMismatch {
            field: "gaze_on_surfaces",
        })?;
        let timestamp = finite_timestamp(raw.timestamp)?;

        let gaze_on_surfaces = gaze
            .into_iter()
            .map(|d| d.into_gaze(true))
            .collect::<Result<Vec<_>, _>>()?;
        let fixations_on_surfaces = raw
            .fixations_on_surfaces
            .into_iter()
            .map(|d| {
                let (duration, dispersion) = (d.duration, d.dispersion);
                d.into_gaze(false).map(|sample| FixationSample {
                    sample,
                    duration,
                    dispersion,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SurfaceFrame {
            topic: raw.topic,
            name: raw.name,
            surf_to_img_trans: raw.surf_to_img_trans,
            img_to_surf_trans: raw.img_to_surf_trans,
            surf_to_dist_img_trans: raw.surf_to_dist_img_trans,
            dist_img_to_surf_trans: raw.dist_img_to_surf_trans,
            gaze_on_surfaces,
            fixations_on_surfaces,
            timestamp,
        })
    }
}

#[derive(Deserialize)]
struct RawStatusUpdate {
    #[serde(default)]
    from: Option<String>,
    // Python clients send either a formatted string or epoch seconds.
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    vehicle_status: Option<String>,
}

impl Decode for StatusUpdate {
    /// Accepts MessagePack or the JSON form produced by [`encode`].
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw = if looks_like_json(bytes) {
            let mut de = serde_json::Deserializer::from_slice(bytes);
            RawStatusUpdate::deserialize(&mut de)?
        } else {
            rmp_serde::from_slice::<RawStatusUpdate>(bytes)?
        };
        let name = raw.vehicle_status.ok_or(DecodeError::SchemaMismatch {
            field: "vehicle_status",
        })?;
        let timestamp = raw.timestamp.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Ok(StatusUpdate {
            from: raw.from,
            timestamp,
            vehicle_status: VehicleStatus::from_wire(&name),
        })
    }
}

// 0x7b is a positive fixint in MessagePack, never the start of a map.
fn looks_like_json(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

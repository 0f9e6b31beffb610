//! NDRT record types: gaze samples, surface frames and operator vehicle status.

use chrono::{DateTime, Local};

/// Topic prefix of the HUD surface published by the eye tracker.
pub const GAZE_TOPIC: &str = "surfaces.HUD";

/// Topic prefix of the vehicle-status feed published by the experiment client.
pub const STATUS_TOPIC: &str = "vehiclestatus";

/// Source id stamped on outbound status records.
pub const DEFAULT_SOURCE_ID: &str = "carla";

/// Normalized position reported when the wire value is unusable.
pub const INVALID_POSITION: [f64; 2] = [-1.0, -1.0];

/// Operator / driving-automation mode. Discriminants are stable (C ABI).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VehicleStatus {
    ManualDrive = 0,
    AutoPilot = 1,
    PreAlertAutoPilot = 2,
    TakeOver = 3,
    TakeOverManual = 4,
    ResumedAutoPilot = 5,
    TrialOver = 6,
    #[default]
    Unknown = 7,
}

impl VehicleStatus {
    pub const ALL: [VehicleStatus; 8] = [
        VehicleStatus::ManualDrive,
        VehicleStatus::AutoPilot,
        VehicleStatus::PreAlertAutoPilot,
        VehicleStatus::TakeOver,
        VehicleStatus::TakeOverManual,
        VehicleStatus::ResumedAutoPilot,
        VehicleStatus::TrialOver,
        VehicleStatus::Unknown,
    ];

    /// Name used on the wire, in both directions.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::ManualDrive => "ManualDrive",
            Self::AutoPilot => "AutoPilot",
            Self::PreAlertAutoPilot => "PreAlertAutopilot",
            Self::TakeOver => "TakeOver",
            Self::TakeOverManual => "TakeOverManual",
            Self::ResumedAutoPilot => "ResumedAutoPilot",
            Self::TrialOver => "TrialOver",
            Self::Unknown => "Unknown",
        }
    }

    /// Case-sensitive lookup; unrecognized names map to `Unknown`.
    pub fn from_wire(name: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.as_wire_str() == name)
            .unwrap_or(Self::Unknown)
    }
}

impl std::fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// Discriminant outside `0..=7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid vehicle status discriminant {0}")]
pub struct InvalidStatus(pub u8);

impl TryFrom<u8> for VehicleStatus {
    type Error = InvalidStatus;

    fn try_from(v: u8) -> Result<Self, InvalidStatus> {
        Self::ALL
            .get(v as usize)
            .copied()
            .ok_or(InvalidStatus(v))
    }
}

/// One decoded gaze-on-surface observation.
#[derive(Debug, Clone, PartialEq)]
pub struct GazeSample {
    pub topic: String,
    /// Position on the surface, or [`INVALID_POSITION`].
    pub normalized_position: [f64; 2],
    pub confidence: f64,
    /// Whether the gaze falls on the tracked surface (`on_surf`).
    pub on_target: bool,
    pub base_topic: String,
    pub base_timestamp: f64,
    pub timestamp: f64,
}

/// A fixation on the surface: a gaze sample plus fixation metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct FixationSample {
    pub sample: GazeSample,
    pub duration: f64,
    pub dispersion: f64,
}

/// One decoded surface message. Lives for a single decode call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceFrame {
    pub topic: String,
    pub name: String,
    pub surf_to_img_trans: Vec<Vec<f64>>,
    pub img_to_surf_trans: Vec<Vec<f64>>,
    pub surf_to_dist_img_trans: Vec<Vec<f64>>,
    pub dist_img_to_surf_trans: Vec<Vec<f64>>,
    pub gaze_on_surfaces: Vec<GazeSample>,
    pub fixations_on_surfaces: Vec<FixationSample>,
    pub timestamp: f64,
}

impl SurfaceFrame {
    /// Gaze sample with the highest timestamp. Ties keep the earlier entry.
    pub fn latest_gaze(&self) -> Option<&GazeSample> {
        self.latest_index().map(|i| &self.gaze_on_surfaces[i])
    }

    /// Consume the frame and keep only its latest gaze sample.
    pub fn into_latest_gaze(mut self) -> Option<GazeSample> {
        let i = self.latest_index()?;
        Some(self.gaze_on_surfaces.swap_remove(i))
    }

    fn latest_index(&self) -> Option<usize> {
        let mut latest: Option<usize> = None;
        for (i, sample) in self.gaze_on_surfaces.iter().enumerate() {
            match latest {
                Some(best) if sample.timestamp <= self.gaze_on_surfaces[best].timestamp => {}
                _ => latest = Some(i),
            }
        }
        latest
    }
}

/// Inbound vehicle-status record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub from: Option<String>,
    pub timestamp: Option<String>,
    pub vehicle_status: VehicleStatus,
}

/// Outbound vehicle-status record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub from: String,
    pub timestamp: DateTime<Local>,
    pub vehicle_status: VehicleStatus,
}

impl StatusRecord {
    /// Record stamped with the current local time.
    pub fn now(from: impl Into<String>, vehicle_status: VehicleStatus) -> Self {
        Self {
            from: from.into(),
            timestamp: Local::now(),
            vehicle_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: f64, x: f64) -> GazeSample {
        GazeSample {
            topic: "gaze".into(),
            normalized_position: [x, 0.5],
            confidence: 0.9,
            on_target: true,
            base_topic: "gaze.3d.01.".into(),
            base_timestamp: ts,
            timestamp: ts,
        }
    }

    #[test]
    fn wire_names_are_case_sensitive() {
        assert_eq!(VehicleStatus::from_wire("AutoPilot"), VehicleStatus::AutoPilot);
        assert_eq!(VehicleStatus::from_wire("autopilot"), VehicleStatus::Unknown);
        assert_eq!(
            VehicleStatus::from_wire("PreAlertAutopilot"),
            VehicleStatus::PreAlertAutoPilot
        );
        assert_eq!(VehicleStatus::from_wire("Cruising"), VehicleStatus::Unknown);
        assert_eq!(VehicleStatus::from_wire(""), VehicleStatus::Unknown);
    }

    #[test]
    fn discriminants_roundtrip() {
        for status in VehicleStatus::ALL {
            assert_eq!(VehicleStatus::try_from(status as u8), Ok(status));
        }
        assert_eq!(VehicleStatus::try_from(8), Err(InvalidStatus(8)));
    }

    #[test]
    fn latest_gaze_prefers_highest_timestamp() {
        let frame = SurfaceFrame {
            gaze_on_surfaces: vec![sample(1.0, 0.1), sample(3.0, 0.3), sample(2.0, 0.2)],
            ..Default::default()
        };
        assert_eq!(frame.latest_gaze().unwrap().normalized_position[0], 0.3);
    }

    #[test]
    fn latest_gaze_tie_keeps_first() {
        let frame = SurfaceFrame {
            gaze_on_surfaces: vec![sample(2.0, 0.1), sample(2.0, 0.2)],
            ..Default::default()
        };
        assert_eq!(frame.latest_gaze().unwrap().normalized_position[0], 0.1);
        assert_eq!(frame.into_latest_gaze().unwrap().normalized_position[0], 0.1);
    }

    #[test]
    fn empty_frame_has_no_latest() {
        assert!(SurfaceFrame::default().latest_gaze().is_none());
        assert!(SurfaceFrame::default().into_latest_gaze().is_none());
    }
}

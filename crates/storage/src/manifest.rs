//! Manifest, pointer and sidecar records, and the published contract check.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use wx_common::{FrameId, OutputMode, PaletteKind, RunId};

use crate::error::{StoreError, StoreResult};

/// Version of the published manifest contract.
pub const CONTRACT_VERSION: u32 = 1;

/// Metadata written beside each staged tile as `<fid>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSidecar {
    pub frame_id: String,
    pub fhr: u32,
    pub valid_time: Option<String>,
    pub units: Option<String>,
    pub output_mode: OutputMode,
    pub palette_kind: PaletteKind,
    pub tile_file: String,
}

impl FrameSidecar {
    pub fn frame(&self) -> Option<FrameId> {
        FrameId::parse(&self.frame_id)
            .ok()
            .filter(|f| f.forecast_hour() == self.fhr)
    }
}

/// Working listing of what is staged for one (model, run, variable).
///
/// Never read by discovery. Derived entirely from the sidecars on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingManifest {
    pub model: String,
    pub run: RunId,
    pub var: String,
    pub frames: Vec<FrameSidecar>,
}

impl StagingManifest {
    pub fn frame_ids(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.frame_id.clone()).collect()
    }
}

/// One frame as exposed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEntry {
    pub frame_id: String,
    pub fhr: u32,
    pub valid_time: Option<String>,
    pub url: String,
    pub frame_image_url: String,
}

/// The published per-variable manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedManifest {
    pub contract_version: u32,
    pub available_frames: usize,
    pub zoom_max: u8,
    pub frames: Vec<FrameEntry>,
}

impl PublishedManifest {
    /// Structural check; a manifest that fails it is never published.
    pub fn validate(&self) -> StoreResult<()> {
        let violation = |msg: String| Err(StoreError::ContractViolation(msg));

        if self.contract_version != CONTRACT_VERSION {
            return violation(format!(
                "contract_version {} (expected {})",
                self.contract_version, CONTRACT_VERSION
            ));
        }
        if self.available_frames != self.frames.len() {
            return violation(format!(
                "available_frames {} but {} frames listed",
                self.available_frames,
                self.frames.len()
            ));
        }
        if self.frames.is_empty() {
            return violation("no frames".to_string());
        }
        let mut previous: Option<u32> = None;
        for frame in &self.frames {
            match FrameId::parse(&frame.frame_id) {
                Ok(id) if id.forecast_hour() == frame.fhr => {}
                _ => {
                    return violation(format!(
                        "frame_id '{}' does not encode fhr {}",
                        frame.frame_id, frame.fhr
                    ))
                }
            }
            if previous.is_some_and(|p| p >= frame.fhr) {
                return violation(format!("frames not strictly ascending at fhr {}", frame.fhr));
            }
            if frame.url.is_empty() || frame.frame_image_url.is_empty() {
                return violation(format!("frame {} has an empty url", frame.frame_id));
            }
            previous = Some(frame.fhr);
        }
        Ok(())
    }

    pub fn frame_ids(&self) -> Vec<&str> {
        self.frames.iter().map(|f| f.frame_id.as_str()).collect()
    }
}

/// Per-model pointer at the newest fully published run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub run: RunId,
}

/// All published variables of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub contract_version: u32,
    pub model: String,
    pub run: RunId,
    pub variables: BTreeMap<String, PublishedManifest>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fhr: u32) -> FrameEntry {
        FrameEntry {
            frame_id: format!("{:03}", fhr),
            fhr,
            valid_time: None,
            url: format!("/tiles/x/{:03}/{{z}}/{{x}}/{{y}}.png", fhr),
            frame_image_url: format!("/frames/x/{:03}.tif", fhr),
        }
    }

    fn manifest(fhrs: &[u32]) -> PublishedManifest {
        PublishedManifest {
            contract_version: CONTRACT_VERSION,
            available_frames: fhrs.len(),
            zoom_max: 7,
            frames: fhrs.iter().map(|&f| entry(f)).collect(),
        }
    }

    #[test]
    fn test_valid_manifest() {
        assert!(manifest(&[0, 3, 6]).validate().is_ok());
    }

    #[test]
    fn test_contract_violations() {
        let mut m = manifest(&[0, 3]);
        m.available_frames = 3;
        assert!(matches!(m.validate(), Err(StoreError::ContractViolation(_))));

        let unordered = manifest(&[3, 0]);
        assert!(unordered.validate().is_err());

        let mut bad_id = manifest(&[0]);
        bad_id.frames[0].frame_id = "0".into();
        assert!(bad_id.validate().is_err());

        let mut version = manifest(&[0]);
        version.contract_version = 2;
        assert!(version.validate().is_err());

        assert!(manifest(&[]).validate().is_err());
    }

    #[test]
    fn test_manifest_json_shape() {
        let json = serde_json::to_value(manifest(&[6])).unwrap();
        assert_eq!(json["contract_version"], 1);
        assert_eq!(json["available_frames"], 1);
        assert_eq!(json["frames"][0]["frame_id"], "006");
        assert_eq!(json["frames"][0]["fhr"], 6);
        assert!(json["frames"][0]["valid_time"].is_null());
    }

    #[test]
    fn test_pointer_json() {
        let p: LatestPointer = serde_json::from_str(r#"{"run":"20260207_01z"}"#).unwrap();
        assert_eq!(p.run.as_str(), "20260207_01z");
        assert!(serde_json::from_str::<LatestPointer>(r#"{"run":"bad"}"#).is_err());
    }

    #[test]
    fn test_sidecar_frame_must_match_fhr() {
        let sidecar = FrameSidecar {
            frame_id: "003".into(),
            fhr: 4,
            valid_time: None,
            units: None,
            output_mode: OutputMode::ByteAlpha,
            palette_kind: PaletteKind::Continuous,
            tile_file: "003.tif".into(),
        };
        assert!(sidecar.frame().is_none());
    }
}

use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Cavity detection settings sent to KVFinder-web with every job.
///
/// Mirrors the input schema of the service: every section is required, so a
/// descriptor missing any of them is rejected when it is loaded rather than
/// when the job is exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[garde(skip)]
    pub modes: Modes,

    #[garde(dive)]
    pub step_size: StepSize,

    #[garde(dive)]
    pub probes: Probes,

    #[garde(dive)]
    pub cutoffs: Cutoffs,

    #[garde(dive)]
    pub visiblebox: BoxDescriptor,

    #[garde(dive)]
    pub internalbox: BoxDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Modes {
    pub whole_protein_mode: bool,
    pub box_mode: bool,
    pub resolution_mode: Resolution,
    pub surface_mode: bool,
    pub kvp_mode: bool,
    pub ligand_mode: bool,
}

/// Grid resolution used by parKVFinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum Resolution {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StepSize {
    #[garde(range(min = 0.0, max = 20.0))]
    pub step_size: f64,
}

/// Probe radii in Angstroms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Probes {
    #[garde(range(min = 0.0, max = 5.0))]
    pub probe_in: f64,

    #[garde(range(min = 0.0, max = 50.0))]
    pub probe_out: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Cutoffs {
    #[garde(range(min = 0.0))]
    pub volume_cutoff: f64,

    #[garde(range(min = 0.0))]
    pub ligand_cutoff: f64,

    #[garde(range(min = 0.0))]
    pub removal_distance: f64,
}

/// Four corner points describing a search box (origin, then one point per axis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BoxDescriptor {
    #[garde(dive)]
    pub p1: BoxPoint,
    #[garde(dive)]
    pub p2: BoxPoint,
    #[garde(dive)]
    pub p3: BoxPoint,
    #[garde(dive)]
    pub p4: BoxPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct BoxPoint {
    #[garde(custom(finite))]
    pub x: f64,
    #[garde(custom(finite))]
    pub y: f64,
    #[garde(custom(finite))]
    pub z: f64,
}

fn finite(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() {
        Ok(())
    } else {
        Err(garde::Error::new("coordinate must be a finite number"))
    }
}

impl BoxPoint {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl BoxDescriptor {
    pub const fn new(p1: BoxPoint, p2: BoxPoint, p3: BoxPoint, p4: BoxPoint) -> Self {
        Self { p1, p2, p3, p4 }
    }
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            whole_protein_mode: true,
            box_mode: false,
            resolution_mode: Resolution::Low,
            surface_mode: true,
            kvp_mode: false,
            ligand_mode: false,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        let origin = BoxPoint::new(0.0, 0.0, 0.0);
        Self {
            modes: Modes::default(),
            step_size: StepSize { step_size: 0.0 },
            probes: Probes {
                probe_in: 1.4,
                probe_out: 4.0,
            },
            cutoffs: Cutoffs {
                volume_cutoff: 5.0,
                ligand_cutoff: 5.0,
                removal_distance: 2.4,
            },
            visiblebox: BoxDescriptor::new(origin, origin, origin, origin),
            internalbox: BoxDescriptor::new(
                BoxPoint::new(-4.0, -4.0, -4.0),
                BoxPoint::new(4.0, -4.0, -4.0),
                BoxPoint::new(-4.0, 4.0, -4.0),
                BoxPoint::new(-4.0, -4.0, 4.0),
            ),
        }
    }
}

impl Settings {
    /// Default settings with the two parameters most often tuned per structure.
    pub fn with_probe_out_and_removal_distance(probe_out: f64, removal_distance: f64) -> Self {
        let mut settings = Self::default();
        settings.probes.probe_out = probe_out;
        settings.cutoffs.removal_distance = removal_distance;
        settings
    }
}

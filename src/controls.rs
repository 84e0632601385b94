// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture controls and the store that applies them to requests.
//!
//! Controls are written by application threads into a *pending* set and
//! picked up by the completion handler, which stages them on the next
//! request it re-queues. Values that reached a request are kept in the
//! *current* set so callers can read back what the hardware was last told.

use crate::hal::{Camera, ControlId, ControlList, ControlValue, Request};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Auto-exposure metering mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    Normal,
    Short,
    Long,
    Custom,
}

/// Auto-focus operating mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfMode {
    Manual,
    Auto,
    Continuous,
}

impl AfMode {
    pub const ALL: [AfMode; 3] = [AfMode::Manual, AfMode::Auto, AfMode::Continuous];

    pub fn name(&self) -> &'static str {
        match self {
            AfMode::Manual => "manual",
            AfMode::Auto => "auto",
            AfMode::Continuous => "continuous",
        }
    }
}

/// One-shot auto-focus trigger. Applied to a single request and never kept
/// as current state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfTrigger {
    Start,
    Cancel,
}

/// Auto white balance illuminant preset.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AwbMode {
    Auto,
    Incandescent,
    Tungsten,
    Fluorescent,
    Indoor,
    Daylight,
    Cloudy,
    Custom,
}

impl AwbMode {
    pub const ALL: [AwbMode; 8] = [
        AwbMode::Auto,
        AwbMode::Incandescent,
        AwbMode::Tungsten,
        AwbMode::Fluorescent,
        AwbMode::Indoor,
        AwbMode::Daylight,
        AwbMode::Cloudy,
        AwbMode::Custom,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AwbMode::Auto => "auto",
            AwbMode::Incandescent => "incandescent",
            AwbMode::Tungsten => "tungsten",
            AwbMode::Fluorescent => "fluorescent",
            AwbMode::Indoor => "indoor",
            AwbMode::Daylight => "daylight",
            AwbMode::Cloudy => "cloudy",
            AwbMode::Custom => "custom",
        }
    }
}

/// Integer representation used by the hardware for the mode enums.
macro_rules! wire_enum {
    ($ty:ident { $($variant:ident = $value:literal),* $(,)? }) => {
        impl From<$ty> for i32 {
            fn from(mode: $ty) -> i32 {
                match mode {
                    $($ty::$variant => $value,)*
                }
            }
        }

        impl TryFrom<i32> for $ty {
            type Error = i32;

            fn try_from(value: i32) -> Result<Self, i32> {
                match value {
                    $($value => Ok($ty::$variant),)*
                    other => Err(other),
                }
            }
        }
    };
}

wire_enum!(ExposureMode { Normal = 0, Short = 1, Long = 2, Custom = 3 });
wire_enum!(AfMode { Manual = 0, Auto = 1, Continuous = 2 });
wire_enum!(AfTrigger { Start = 0, Cancel = 1 });
wire_enum!(AwbMode {
    Auto = 0,
    Incandescent = 1,
    Tungsten = 2,
    Fluorescent = 3,
    Indoor = 4,
    Daylight = 5,
    Cloudy = 6,
    Custom = 7,
});

/// Sparse set of control values. Absent fields mean "leave unchanged".
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_mode: Option<ExposureMode>,
    /// Exposure time in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_time: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analogue_gain: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub af_mode: Option<AfMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub af_trigger: Option<AfTrigger>,
    /// Dioptres, 0.0 is infinity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lens_position: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub awb_mode: Option<AwbMode>,
    /// Red and blue gains.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colour_gains: Option<[f32; 2]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saturation: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_fps: Option<i32>,
    /// JPEG quality 1-100, consumed by the encoder rather than the sensor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jpeg_quality: Option<i32>,
}

macro_rules! merge_fields {
    ($dst:expr, $src:expr, $($field:ident),* $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )*
    };
}

impl ControlSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every field present in `other` over `self`, leaving fields
    /// absent from `other` untouched.
    pub fn merge(&mut self, other: &ControlSet) {
        merge_fields!(
            self,
            other,
            exposure_mode,
            exposure_time,
            analogue_gain,
            af_mode,
            af_trigger,
            lens_position,
            awb_mode,
            colour_gains,
            brightness,
            contrast,
            saturation,
            sharpness,
            target_fps,
            jpeg_quality,
        );
    }

    pub fn is_empty(&self) -> bool {
        *self == ControlSet::default()
    }

    /// Hardware controls for every present field. JPEG quality has no
    /// hardware counterpart and is left out; the target frame rate becomes a
    /// fixed frame duration.
    pub fn to_control_list(&self) -> ControlList {
        let mut list = ControlList::new();

        let int = |mode: i32| ControlValue::Int32(mode);
        if let Some(v) = self.exposure_mode {
            list.set(ControlId::AeExposureMode, int(v.into()));
        }
        if let Some(v) = self.exposure_time {
            list.set(ControlId::ExposureTime, int(v));
        }
        if let Some(v) = self.analogue_gain {
            list.set(ControlId::AnalogueGain, ControlValue::Float(v));
        }
        if let Some(v) = self.af_mode {
            list.set(ControlId::AfMode, int(v.into()));
        }
        if let Some(v) = self.af_trigger {
            list.set(ControlId::AfTrigger, int(v.into()));
        }
        if let Some(v) = self.lens_position {
            list.set(ControlId::LensPosition, ControlValue::Float(v));
        }
        if let Some(v) = self.awb_mode {
            list.set(ControlId::AwbMode, int(v.into()));
        }
        if let Some(v) = self.colour_gains {
            list.set(ControlId::ColourGains, ControlValue::FloatPair(v));
        }
        if let Some(v) = self.brightness {
            list.set(ControlId::Brightness, ControlValue::Float(v));
        }
        if let Some(v) = self.contrast {
            list.set(ControlId::Contrast, ControlValue::Float(v));
        }
        if let Some(v) = self.saturation {
            list.set(ControlId::Saturation, ControlValue::Float(v));
        }
        if let Some(v) = self.sharpness {
            list.set(ControlId::Sharpness, ControlValue::Float(v));
        }
        if let Some(fps) = self.target_fps {
            let duration = frame_duration_us(fps);
            list.set(
                ControlId::FrameDurationLimits,
                ControlValue::Int64Pair([duration, duration]),
            );
        }

        list
    }
}

/// Frame duration in microseconds for a target frame rate.
pub fn frame_duration_us(fps: i32) -> i64 {
    1_000_000 / i64::from(fps.max(1))
}

/// `{min, max, default}` reported by the hardware for a numeric control.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

/// What the camera supports. Numeric ranges come from the hardware, the
/// mode lists are fixed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub exposure_time: Option<Range>,
    pub analogue_gain: Option<Range>,
    pub lens_position: Option<Range>,
    pub af_modes: Vec<String>,
    pub awb_modes: Vec<String>,
}

#[derive(Debug, Default)]
struct ControlState {
    current: ControlSet,
    pending: Option<ControlSet>,
}

/// Holds the last-applied and pending control values behind one mutex.
pub struct ControlStore {
    camera: Arc<dyn Camera>,
    state: Mutex<ControlState>,
}

impl ControlStore {
    pub fn new(camera: Arc<dyn Camera>) -> Self {
        Self {
            camera,
            state: Mutex::new(ControlState::default()),
        }
    }

    /// Merges `controls` into the pending set.
    pub fn submit(&self, controls: &ControlSet) {
        let mut state = self.state.lock().expect("control store poisoned");
        state
            .pending
            .get_or_insert_with(ControlSet::default)
            .merge(controls);
    }

    pub fn has_pending(&self) -> bool {
        let state = self.state.lock().expect("control store poisoned");
        state.pending.is_some()
    }

    /// Stages the pending set on `request` and clears it. Returns `false`
    /// when nothing was pending.
    pub fn apply_pending(&self, request: &mut Request) -> bool {
        let mut state = self.state.lock().expect("control store poisoned");
        let Some(pending) = state.pending.take() else {
            return false;
        };
        debug!(request = request.cookie(), "applying pending controls {:?}", pending);
        Self::stage(&mut state.current, &pending, request);
        true
    }

    /// Stages `controls` on `request` regardless of the pending set. Used
    /// for the initial values at start.
    pub fn apply(&self, controls: &ControlSet, request: &mut Request) {
        let mut state = self.state.lock().expect("control store poisoned");
        Self::stage(&mut state.current, controls, request);
    }

    fn stage(current: &mut ControlSet, controls: &ControlSet, request: &mut Request) {
        request.controls_mut().merge(&controls.to_control_list());

        let mut retained = *controls;
        retained.af_trigger = None;
        current.merge(&retained);
    }

    /// Copy of the last-applied values.
    pub fn snapshot(&self) -> ControlSet {
        self.state.lock().expect("control store poisoned").current
    }

    pub fn capabilities(&self) -> Capabilities {
        let range = |id| {
            let info = self.camera.control_info(id)?;
            Some(Range {
                min: info.min.as_f64()?,
                max: info.max.as_f64()?,
                default: info.def.as_f64()?,
            })
        };

        Capabilities {
            exposure_time: range(ControlId::ExposureTime),
            analogue_gain: range(ControlId::AnalogueGain),
            lens_position: range(ControlId::LensPosition),
            af_modes: AfMode::ALL.iter().map(|m| m.name().to_string()).collect(),
            awb_modes: AwbMode::ALL.iter().map(|m| m.name().to_string()).collect(),
        }
    }
}

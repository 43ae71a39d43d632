//! Cell configuration and the data-driven pick-and-place routine.
//!
//! A deployment is described entirely by a TOML file: endpoints, calibration,
//! stacking geometry and the ordered step lists replayed every cycle. Only
//! anchored coordinates change between cycles (the pick target and the stack
//! slot); everything else is fixed data.

use crate::safety::SafetyConfig;
use crate::store::CounterLayout;
use crate::transform::Calibration;
use crate::types::{MotionParams, OutputBank, PartClass, Phase, RobotPose};
use crate::{CellError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const ENV_VISION_HOST: &str = "PICKCELL_VISION_HOST";
pub const ENV_VISION_PORT: &str = "PICKCELL_VISION_PORT";
pub const ENV_PLC_HOST: &str = "PICKCELL_PLC_HOST";

/// Complete cell deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct CellConfig {
    pub vision: VisionConfig,
    #[serde(default)]
    pub plc: PlcConfig,
    pub routine: RoutineDefinition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub host: String,
    #[serde(default = "default_vision_port")]
    pub port: u16,
    /// Control-box output held high while a pose request is in flight.
    #[serde(default = "default_request_pin")]
    pub request_pin: u8,
    /// Unset means wait forever for the reply.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Let the arm settle at the camera pose before triggering.
    #[serde(default = "default_settle_ms")]
    pub settle_before_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_after_ms: u64,
}

fn default_vision_port() -> u16 {
    20000
}

fn default_request_pin() -> u8 {
    1
}

fn default_settle_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    pub host: String,
    pub rack: u16,
    pub slot: u16,
    pub layout: CounterLayout,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.1".into(),
            rack: 0,
            slot: 1,
            layout: CounterLayout::default(),
        }
    }
}

/// Default speed profile for steps that do not override it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MotionDefaults {
    /// mm/s
    pub linear_speed: f64,
    pub linear_acceleration: f64,
    /// deg/s
    pub joint_speed: f64,
    pub joint_acceleration: f64,
    /// Negative disables blending between moves.
    pub radius: f64,
}

impl Default for MotionDefaults {
    fn default() -> Self {
        Self {
            linear_speed: 400.0,
            linear_acceleration: 300.0,
            joint_speed: 70.0,
            joint_acceleration: 500.0,
            radius: -1.0,
        }
    }
}

impl MotionDefaults {
    pub fn linear(&self, speed: Option<f64>, acceleration: Option<f64>) -> MotionParams {
        MotionParams {
            speed: speed.unwrap_or(self.linear_speed),
            acceleration: acceleration.unwrap_or(self.linear_acceleration),
            wait: true,
            radius: self.radius,
        }
    }

    pub fn joint(&self, speed: Option<f64>, acceleration: Option<f64>) -> MotionParams {
        MotionParams {
            speed: speed.unwrap_or(self.joint_speed),
            acceleration: acceleration.unwrap_or(self.joint_acceleration),
            wait: true,
            radius: self.radius,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StackingConfig {
    /// Layers per bin before the full-bin branch is taken.
    pub capacity: u16,
    /// Height of one stacked layer (mm).
    pub slot_pitch: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Control-box digital input on the arm.
    Input,
    /// `PART_ON_CONVEYOR` flag in the PLC record.
    Store,
    /// Run cycles back to back.
    Always,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TriggerConfig {
    pub source: TriggerSource,
    #[serde(default)]
    pub pin: Option<u8>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    20
}

/// One-time arm setup before the first cycle.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PrepareConfig {
    /// Wait after enabling motion before issuing commands.
    pub settle_ms: u64,
    pub pause_time_ms: u64,
    /// Tool outputs forced low at startup (gripper released).
    pub reset_tool_pins: Vec<u8>,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            pause_time_ms: 500,
            reset_tool_pins: vec![0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Which coordinates of a cartesian step are filled in per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    #[default]
    Fixed,
    /// x, y and yaw come from the calibrated vision pose.
    Pick,
    /// The given axis is shifted by the current stack slot offset.
    Slot(Axis),
}

/// One entry of a step list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MotionStep {
    Joints {
        angles: [f64; 6],
        speed: Option<f64>,
        acceleration: Option<f64>,
        label: Option<String>,
    },
    Cartesian {
        /// `[x, y, z, roll, pitch, yaw]`
        pose: [f64; 6],
        #[serde(default)]
        anchor: Anchor,
        speed: Option<f64>,
        acceleration: Option<f64>,
        label: Option<String>,
    },
    Output {
        bank: OutputBank,
        pin: u8,
        on: bool,
        label: Option<String>,
    },
}

impl MotionStep {
    pub fn command_name(&self) -> &'static str {
        match self {
            MotionStep::Joints { .. } => "move_joints",
            MotionStep::Cartesian { .. } => "move_cartesian",
            MotionStep::Output { .. } => "set_digital_output",
        }
    }

    /// Name used in logs and errors.
    pub fn label(&self) -> &str {
        let label = match self {
            MotionStep::Joints { label, .. }
            | MotionStep::Cartesian { label, .. }
            | MotionStep::Output { label, .. } => label,
        };
        label.as_deref().unwrap_or_else(|| self.command_name())
    }

    fn anchor(&self) -> Anchor {
        match self {
            MotionStep::Cartesian { anchor, .. } => *anchor,
            _ => Anchor::Fixed,
        }
    }

    fn numbers(&self) -> Vec<f64> {
        match self {
            MotionStep::Joints {
                angles,
                speed,
                acceleration,
                ..
            } => angles.iter().copied().chain(*speed).chain(*acceleration).collect(),
            MotionStep::Cartesian {
                pose,
                speed,
                acceleration,
                ..
            } => pose.iter().copied().chain(*speed).chain(*acceleration).collect(),
            MotionStep::Output { .. } => Vec::new(),
        }
    }
}

/// Per-cycle values substituted into anchored steps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Anchors {
    pub pick: Option<RobotPose>,
    pub slot_offset: Option<f64>,
}

/// Resolve the target of a cartesian step for the current cycle.
pub fn resolve_pose(pose: &[f64; 6], anchor: Anchor, anchors: &Anchors) -> Result<[f64; 6]> {
    let mut target = *pose;
    match anchor {
        Anchor::Fixed => {}
        Anchor::Pick => {
            let pick = anchors
                .pick
                .ok_or_else(|| CellError::Config("pick-anchored step has no pick target".into()))?;
            target[0] = pick.x;
            target[1] = pick.y;
            target[5] = pick.r;
        }
        Anchor::Slot(axis) => {
            let offset = anchors
                .slot_offset
                .ok_or_else(|| CellError::Config("slot-anchored step has no slot offset".into()))?;
            target[axis.index()] += offset;
        }
    }
    Ok(target)
}

/// Step lists for one destination bin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BinRoutine {
    /// Approach above the stack.
    pub place: Vec<MotionStep>,
    /// Stack is at capacity: drop into the full-bin location.
    pub full_bin: Vec<MotionStep>,
    /// Put the part on the stack and back off.
    pub advance: Vec<MotionStep>,
}

/// A complete pick-and-place program.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoutineDefinition {
    pub name: String,
    #[serde(default)]
    pub motion: MotionDefaults,
    pub calibration: Calibration,
    pub stacking: StackingConfig,
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub prepare: PrepareConfig,
    pub home: Vec<MotionStep>,
    pub approach: Vec<MotionStep>,
    pub pick: Vec<MotionStep>,
    pub retreat: Vec<MotionStep>,
    pub good_bin: BinRoutine,
    #[serde(default)]
    pub scrap_bin: Option<BinRoutine>,
}

impl RoutineDefinition {
    pub fn bin(&self, class: PartClass) -> Result<&BinRoutine> {
        match class {
            PartClass::Good => Ok(&self.good_bin),
            PartClass::Scrap => self.scrap_bin.as_ref().ok_or_else(|| {
                CellError::Config(format!(
                    "routine '{}' has no scrap bin but the PLC requested scrap routing",
                    self.name
                ))
            }),
        }
    }

    /// Step list executed in `phase` for a part of `class`.
    pub fn steps(&self, phase: Phase, class: PartClass) -> Result<&[MotionStep]> {
        let steps = match phase {
            Phase::Home => &self.home,
            Phase::Approach => &self.approach,
            Phase::Pick => &self.pick,
            Phase::RetreatToSafe => &self.retreat,
            Phase::Place => &self.bin(class)?.place,
            Phase::ResetSlot => &self.bin(class)?.full_bin,
            Phase::AdvanceSlot => &self.bin(class)?.advance,
            other => {
                return Err(CellError::Config(format!("phase {} has no step list", other)))
            }
        };
        Ok(steps.as_slice())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.trigger.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.calibration.validate()?;

        if self.stacking.capacity == 0 {
            return Err(CellError::Config("stacking.capacity must be at least 1".into()));
        }
        if !self.stacking.slot_pitch.is_finite() {
            return Err(CellError::Config("stacking.slot_pitch must be finite".into()));
        }
        if self.trigger.source == TriggerSource::Input && self.trigger.pin.is_none() {
            return Err(CellError::Config("trigger.source = \"input\" requires trigger.pin".into()));
        }

        let m = &self.motion;
        for v in [m.linear_speed, m.linear_acceleration, m.joint_speed, m.joint_acceleration] {
            if !(v.is_finite() && v > 0.0) {
                return Err(CellError::Config("motion speeds must be positive".into()));
            }
        }

        // Pick anchors are only known after the vision pose, slot anchors only
        // after the slot computation.
        let pick_ok = [Phase::Approach, Phase::Pick];
        let slot_ok = [Phase::Place, Phase::ResetSlot, Phase::AdvanceSlot];
        let mut lists: Vec<(Phase, &str, &[MotionStep])> = vec![
            (Phase::Home, "home", self.home.as_slice()),
            (Phase::Approach, "approach", self.approach.as_slice()),
            (Phase::Pick, "pick", self.pick.as_slice()),
            (Phase::RetreatToSafe, "retreat", self.retreat.as_slice()),
        ];
        for bin in [Some(&self.good_bin), self.scrap_bin.as_ref()].into_iter().flatten() {
            lists.push((Phase::Place, "place", bin.place.as_slice()));
            lists.push((Phase::ResetSlot, "full_bin", bin.full_bin.as_slice()));
            lists.push((Phase::AdvanceSlot, "advance", bin.advance.as_slice()));
        }

        for (phase, name, steps) in lists {
            for step in steps {
                if step.numbers().iter().any(|v| !v.is_finite()) {
                    return Err(CellError::Config(format!(
                        "step '{}' in {} has a non-finite value",
                        step.label(),
                        name
                    )));
                }
                let allowed = match step.anchor() {
                    Anchor::Fixed => true,
                    Anchor::Pick => pick_ok.contains(&phase),
                    Anchor::Slot(_) => slot_ok.contains(&phase),
                };
                if !allowed {
                    return Err(CellError::Config(format!(
                        "step '{}' in {} uses {:?} anchor outside its phase",
                        step.label(),
                        name,
                        step.anchor()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl CellConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CellConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vision.host.trim().is_empty() {
            return Err(CellError::Config("vision.host is empty".into()));
        }
        self.routine.validate()
    }

    /// Override endpoints from the environment (site-specific addresses).
    pub fn apply_env_overrides(&mut self) {
        self.vision.host = read_env_string(ENV_VISION_HOST, &self.vision.host);
        self.vision.port = read_env_u16(ENV_VISION_PORT, self.vision.port);
        self.plc.host = read_env_string(ENV_PLC_HOST, &self.plc.host);
    }
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

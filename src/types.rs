use serde::Deserialize;
use std::fmt;

/// Object pose as reported by the vision sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Horizontal image coordinate in pixels.
    pub x: f64,
    /// Vertical image coordinate in pixels.
    pub y: f64,
    /// Object rotation in degrees.
    pub r: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, r: f64) -> Self {
        Self { x, y, r }
    }

    /// The sensor reports `(0, 0)` when nothing was detected.
    pub fn is_no_detection(&self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }
}

/// Pick target in robot base coordinates (millimeters, degrees).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobotPose {
    pub x: f64,
    pub y: f64,
    /// Tool yaw in degrees.
    pub r: f64,
}

/// Which bin a part is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartClass {
    Good,
    Scrap,
}

impl fmt::Display for PartClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartClass::Good => f.write_str("good"),
            PartClass::Scrap => f.write_str("scrap"),
        }
    }
}

bitflags::bitflags! {
    /// Status byte shared with the PLC/HMI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u8 {
        /// Set by the cell while a cycle is running.
        const WORKING          = 1 << 0;
        const ROUTINE_OK       = 1 << 1;
        /// Conveyor sensor reports a part waiting.
        const PART_ON_CONVEYOR = 1 << 2;
        /// Operator stop requested from the HMI.
        const STOP             = 1 << 3;
        /// Route the next part to the scrap bin.
        const ROUTINE_SCRAP    = 1 << 4;
    }
}

/// Digital output bank on the manipulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputBank {
    /// Control-box I/O.
    Controller,
    /// End-effector (tool flange) I/O.
    Tool,
}

/// Speed profile of a single blocking move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionParams {
    /// mm/s for cartesian moves, deg/s for joint moves.
    pub speed: f64,
    pub acceleration: f64,
    /// Block until the move completes.
    pub wait: bool,
    /// Blend radius; negative disables blending.
    pub radius: f64,
}

/// Asynchronous notification pushed by the manipulator driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorEvent {
    ErrorWarnChanged { error_code: i32, warn_code: i32 },
    StateChanged { state: i32 },
    CountChanged { count: i64 },
    ConnectionChanged { connected: bool, reported: bool },
}

/// Safety monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyPhase {
    Running,
    /// Monitor shutting down and draining queued notifications.
    Stopping,
    /// Terminal for the current run.
    Stopped,
}

/// Why the safety monitor left `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Error { code: i32 },
    TerminalState { state: i32 },
    Disconnected,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Error { code } => write!(f, "actuator error {}", code),
            StopReason::TerminalState { state } => write!(f, "actuator entered state {}", state),
            StopReason::Disconnected => f.write_str("actuator disconnected"),
            StopReason::Shutdown => f.write_str("safety monitor shut down"),
        }
    }
}

/// Snapshot of the process-wide safety record.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyState {
    pub phase: SafetyPhase,
    /// Last nonzero error code reported by the actuator (sticky).
    pub error_code: i32,
    pub connected: bool,
    pub reason: Option<StopReason>,
}

impl SafetyState {
    pub fn alive(&self) -> bool {
        self.phase == SafetyPhase::Running
    }
}

impl Default for SafetyState {
    fn default() -> Self {
        Self {
            phase: SafetyPhase::Running,
            error_code: 0,
            connected: true,
            reason: None,
        }
    }
}

/// Cycle phase of the sequencing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    WaitTrigger,
    Home,
    AcquirePose,
    Transform,
    Approach,
    Pick,
    RetreatToSafe,
    PlaceSlotCompute,
    Place,
    CapacityCheck,
    ResetSlot,
    AdvanceSlot,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Prepare => "PREPARE",
            Phase::WaitTrigger => "WAIT_TRIGGER",
            Phase::Home => "HOME",
            Phase::AcquirePose => "ACQUIRE_POSE",
            Phase::Transform => "TRANSFORM",
            Phase::Approach => "APPROACH",
            Phase::Pick => "PICK",
            Phase::RetreatToSafe => "RETREAT_TO_SAFE",
            Phase::PlaceSlotCompute => "PLACE_SLOT_COMPUTE",
            Phase::Place => "PLACE",
            Phase::CapacityCheck => "CAPACITY_CHECK",
            Phase::ResetSlot => "RESET_SLOT",
            Phase::AdvanceSlot => "ADVANCE_SLOT",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// PLC CPU run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Run,
    Stop,
    Unknown,
}

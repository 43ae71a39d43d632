use crate::types::{ActuatorEvent, MotionParams, OutputBank};
use crossbeam_channel::Receiver;
use std::time::Duration;

/// Status code returned by every actuator command. `0` is success.
pub type Code = i32;

pub const CODE_OK: Code = 0;

/// Manipulator driver consumed by the sequencing engine.
///
/// Commands block until the driver acknowledges them; motion commands with
/// `params.wait == true` block until the move completes. Implementations
/// report failures through the returned code and never panic.
pub trait MotionActuator {
    fn connect(&mut self) -> Code;
    fn disconnect(&mut self) -> Code;

    fn motion_enable(&mut self, enable: bool) -> Code;
    fn set_mode(&mut self, mode: i32) -> Code;
    fn set_state(&mut self, state: i32) -> Code;
    fn clean_error(&mut self) -> Code;
    fn clean_warn(&mut self) -> Code;
    /// Pause inserted by the controller between queued commands.
    fn set_pause_time(&mut self, pause: Duration) -> Code;

    /// Register for error/state/count/connection notifications.
    ///
    /// The subscription lives as long as the returned receiver; dropping it
    /// releases the registration (the driver prunes disconnected senders).
    fn subscribe(&mut self) -> Receiver<ActuatorEvent>;

    fn set_digital_output(&mut self, bank: OutputBank, pin: u8, on: bool) -> Code;
    /// Read a control-box digital input.
    fn digital_input(&mut self, pin: u8) -> Result<bool, Code>;

    fn move_joints(&mut self, angles: &[f64; 6], params: &MotionParams) -> Code;
    /// Move the tool to `[x, y, z, roll, pitch, yaw]` (mm, degrees).
    fn move_cartesian(&mut self, pose: &[f64; 6], params: &MotionParams) -> Code;

    /// Controller error code; nonzero means the arm refuses motion.
    fn error_code(&self) -> i32;
    fn state(&self) -> i32;
    fn is_connected(&self) -> bool;
}

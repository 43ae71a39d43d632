//! Pick-and-place sequencing engine.
//!
//! One control thread drives the cycle:
//! `WAIT_TRIGGER → HOME → ACQUIRE_POSE → TRANSFORM → APPROACH → PICK →
//! RETREAT_TO_SAFE → PLACE_SLOT_COMPUTE → PLACE → CAPACITY_CHECK →
//! (RESET_SLOT | ADVANCE_SLOT)`, then back to waiting.
//!
//! Every actuator command is preceded by a guard (safety record running, quit
//! flag clear, actuator error code zero). A failed guard or command aborts the
//! cycle where it stands. Nothing is rolled back.

use crate::actuator::{MotionActuator, CODE_OK};
use crate::routine::{resolve_pose, Anchors, CellConfig, MotionStep, RoutineDefinition, TriggerSource};
use crate::safety::{SafetyHandle, SafetyMonitor};
use crate::store::{BlockStore, CounterStore};
use crate::types::{CpuState, OutputBank, PartClass, Phase, Pose, RobotPose, StatusFlags, StopReason};
use crate::vision::PoseClient;
use crate::{CellError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared quit flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run-scoped state passed around instead of globals.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub safety: SafetyHandle,
    pub quit: StopSignal,
    /// Completed cycles since the engine was created.
    pub cycles: u64,
    pub phase: Phase,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self {
            safety: SafetyHandle::new(),
            quit: StopSignal::new(),
            cycles: 0,
            phase: Phase::Prepare,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub class: PartClass,
    /// Raw sensor reading.
    pub pose: Pose,
    /// Calibrated pick target.
    pub target: RobotPose,
    pub slot_offset: f64,
    pub counter_before: u16,
    pub counter_after: u16,
    /// The stack was at capacity and the part went to the full-bin location.
    pub full_bin: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The sensor reported nothing; no motion after the request, counter untouched.
    NoDetection(Pose),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub skipped: u64,
    /// The run ended on an operator stop (PLC flag or [`StopSignal`]).
    pub operator_stop: bool,
}

pub struct SequenceEngine<A, S> {
    actuator: A,
    counters: CounterStore<S>,
    vision: PoseClient,
    config: CellConfig,
    context: EngineContext,
    monitor: Option<SafetyMonitor>,
    prepared: bool,
    stopped: bool,
}

impl<A: MotionActuator, S: BlockStore> SequenceEngine<A, S> {
    pub fn new(actuator: A, store: S, config: CellConfig) -> Result<Self> {
        config.validate()?;
        let counters = CounterStore::new(store, config.plc.layout.clone());
        let vision = PoseClient::from_config(&config.vision);
        Ok(Self {
            actuator,
            counters,
            vision,
            config,
            context: EngineContext::default(),
            monitor: None,
            prepared: false,
            stopped: false,
        })
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn counters(&self) -> &CounterStore<S> {
        &self.counters
    }

    /// Counter maintenance between runs (e.g. resetting a stack).
    pub fn counters_mut(&mut self) -> &mut CounterStore<S> {
        &mut self.counters
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn routine(&self) -> &RoutineDefinition {
        &self.config.routine
    }

    /// Handle for requesting a stop from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.context.quit.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Connect the PLC, clear and enable the arm, start the safety monitor.
    ///
    /// Called automatically by [`run`](Self::run) if not done explicitly.
    pub fn prepare(&mut self) -> Result<()> {
        if self.stopped {
            return Err(CellError::AlreadyStopped);
        }
        if self.prepared {
            return Ok(());
        }
        self.context.phase = Phase::Prepare;
        let result = self.prepare_inner();
        result.map_err(|e| self.fail(e))
    }

    fn prepare_inner(&mut self) -> Result<()> {
        let phase = Phase::Prepare;
        let plc = self.config.plc.clone();
        let cpu = self.counters.connect(&plc.host, plc.rack, plc.slot)?;
        if cpu != CpuState::Run {
            log::warn!("PLC CPU is not in RUN ({:?})", cpu);
        }

        if !self.actuator.is_connected() {
            check(phase, "connect", self.actuator.connect())?;
        }
        check(phase, "clean_warn", self.actuator.clean_warn())?;
        check(phase, "clean_error", self.actuator.clean_error())?;
        check(phase, "motion_enable", self.actuator.motion_enable(true))?;
        check(phase, "set_mode", self.actuator.set_mode(0))?;
        check(phase, "set_state", self.actuator.set_state(0))?;
        sleep_ms(self.config.routine.prepare.settle_ms);

        let events = self.actuator.subscribe();
        let monitor = SafetyMonitor::start(
            events,
            self.context.safety.clone(),
            &self.config.routine.safety,
        )?;
        self.monitor = Some(monitor);

        for pin in self.config.routine.prepare.reset_tool_pins.clone() {
            self.guard(phase)?;
            check(
                phase,
                "set_digital_output",
                self.actuator.set_digital_output(OutputBank::Tool, pin, false),
            )?;
        }
        let pause = Duration::from_millis(self.config.routine.prepare.pause_time_ms);
        check(phase, "set_pause_time", self.actuator.set_pause_time(pause))?;

        self.prepared = true;
        log::info!("Cell prepared, routine '{}'", self.config.routine.name);
        Ok(())
    }

    /// Run until an operator stop or an error.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.run_inner(None)
    }

    /// Run until `cycles` triggers have been served (completed or skipped).
    pub fn run_for(&mut self, cycles: u64) -> Result<RunSummary> {
        self.run_inner(Some(cycles))
    }

    /// Run one cycle now, without waiting for a trigger.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.prepare()?;
        let result = self.cycle();
        match result {
            Ok(outcome) => Ok(outcome),
            Err(CellError::StopRequested { phase }) => {
                log::info!("[{}] stop requested", phase);
                self.finish();
                Err(CellError::StopRequested { phase })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stop the safety monitor and end the run. The engine cannot be restarted.
    pub fn shutdown(&mut self) {
        if !self.stopped {
            self.context.quit.request();
            self.finish();
        }
    }

    fn run_inner(&mut self, limit: Option<u64>) -> Result<RunSummary> {
        self.prepare()?;

        let mut summary = RunSummary::default();
        loop {
            if let Some(limit) = limit {
                if summary.cycles + summary.skipped >= limit {
                    break;
                }
            }

            match self.poll_once() {
                Ok(None) => {}
                Ok(Some(CycleOutcome::Completed(_))) => summary.cycles += 1,
                Ok(Some(CycleOutcome::NoDetection(_))) => summary.skipped += 1,
                Err(CellError::StopRequested { phase }) => {
                    log::info!("[{}] stop requested, ending run", phase);
                    summary.operator_stop = true;
                    self.finish();
                    break;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }

        log::info!(
            "Run finished: {} cycles, {} skipped",
            summary.cycles,
            summary.skipped
        );
        Ok(summary)
    }

    /// One pass of WAIT_TRIGGER. Returns `None` when not triggered.
    fn poll_once(&mut self) -> Result<Option<CycleOutcome>> {
        let phase = Phase::WaitTrigger;
        self.context.phase = phase;
        self.guard(phase)?;

        let flags = self.counters.read_flags()?;
        if flags.contains(StatusFlags::STOP) {
            return Err(CellError::StopRequested { phase });
        }

        let trigger = &self.config.routine.trigger;
        let triggered = match trigger.source {
            TriggerSource::Always => true,
            TriggerSource::Store => flags.contains(StatusFlags::PART_ON_CONVEYOR),
            TriggerSource::Input => {
                let pin = trigger.pin.ok_or_else(|| {
                    CellError::Config("input trigger without a pin".into())
                })?;
                self.actuator
                    .digital_input(pin)
                    .map_err(|code| CellError::Command {
                        phase,
                        command: "digital_input".into(),
                        code,
                    })?
            }
        };

        if !triggered {
            std::thread::sleep(self.config.routine.poll_interval());
            return Ok(None);
        }
        log::debug!("Trigger received");
        self.cycle().map(Some)
    }

    fn cycle(&mut self) -> Result<CycleOutcome> {
        let flags = self.counters.read_flags()?;
        if flags.contains(StatusFlags::STOP) {
            return Err(CellError::StopRequested {
                phase: Phase::WaitTrigger,
            });
        }
        let class = if flags.contains(StatusFlags::ROUTINE_SCRAP) {
            PartClass::Scrap
        } else {
            PartClass::Good
        };

        let stacking = self.config.routine.stacking.clone();
        let counter = self
            .counters
            .snapshot(class, stacking.capacity, stacking.slot_pitch)?;
        self.counters
            .update_flags(StatusFlags::WORKING, StatusFlags::ROUTINE_OK)?;
        log::info!(
            "Cycle {} start: {} part, stack {}/{}",
            self.context.cycles + 1,
            class,
            counter.value(),
            counter.capacity()
        );

        self.run_steps(Phase::Home, class, &Anchors::default())?;
        let pose = self.acquire_pose()?;

        self.context.phase = Phase::Transform;
        let target = self.config.routine.calibration.to_robot_space(&pose);
        if pose.is_no_detection() {
            log::warn!("No part detected, skipping cycle");
            self.counters
                .update_flags(StatusFlags::empty(), StatusFlags::WORKING)?;
            return Ok(CycleOutcome::NoDetection(pose));
        }
        log::info!(
            "Pick target: x={:.1} y={:.1} r={:.1}",
            target.x,
            target.y,
            target.r
        );

        let mut anchors = Anchors {
            pick: Some(target),
            slot_offset: None,
        };
        self.run_steps(Phase::Approach, class, &anchors)?;
        self.run_steps(Phase::Pick, class, &anchors)?;
        self.run_steps(Phase::RetreatToSafe, class, &anchors)?;

        self.context.phase = Phase::PlaceSlotCompute;
        let slot_offset = counter.slot_offset();
        anchors.slot_offset = Some(slot_offset);
        log::debug!("Slot offset {} for counter {}", slot_offset, counter.value());
        self.run_steps(Phase::Place, class, &anchors)?;

        self.context.phase = Phase::CapacityCheck;
        let full_bin = counter.is_full();
        if full_bin {
            log::info!("{} stack full, using full-bin location", class);
            self.run_steps(Phase::ResetSlot, class, &anchors)?;
        } else {
            self.run_steps(Phase::AdvanceSlot, class, &anchors)?;
        }

        let counter_after = self.counters.increment(class, stacking.capacity)?;
        self.counters
            .update_flags(StatusFlags::ROUTINE_OK, StatusFlags::WORKING)?;
        self.context.cycles += 1;

        Ok(CycleOutcome::Completed(CycleReport {
            class,
            pose,
            target,
            slot_offset,
            counter_before: counter.value(),
            counter_after,
            full_bin,
        }))
    }

    /// Request a pose while holding the handshake output high.
    fn acquire_pose(&mut self) -> Result<Pose> {
        let phase = Phase::AcquirePose;
        self.context.phase = phase;
        let pin = self.config.vision.request_pin;
        sleep_ms(self.config.vision.settle_before_ms);

        self.guard(phase)?;
        check(
            phase,
            "set_digital_output",
            self.actuator
                .set_digital_output(OutputBank::Controller, pin, true),
        )?;

        let pose = self.vision.request_pose()?;

        self.guard(phase)?;
        check(
            phase,
            "set_digital_output",
            self.actuator
                .set_digital_output(OutputBank::Controller, pin, false),
        )?;
        sleep_ms(self.config.vision.settle_after_ms);
        Ok(pose)
    }

    fn run_steps(&mut self, phase: Phase, class: PartClass, anchors: &Anchors) -> Result<()> {
        self.context.phase = phase;
        let steps = self.config.routine.steps(phase, class)?;
        let motion = &self.config.routine.motion;

        for step in steps {
            self.guard(phase)?;
            log::debug!("[{}] {}", phase, step.label());
            let code = match step {
                MotionStep::Joints {
                    angles,
                    speed,
                    acceleration,
                    ..
                } => self
                    .actuator
                    .move_joints(angles, &motion.joint(*speed, *acceleration)),
                MotionStep::Cartesian {
                    pose,
                    anchor,
                    speed,
                    acceleration,
                    ..
                } => {
                    let target = resolve_pose(pose, *anchor, anchors)?;
                    self.actuator
                        .move_cartesian(&target, &motion.linear(*speed, *acceleration))
                }
                MotionStep::Output { bank, pin, on, .. } => {
                    self.actuator.set_digital_output(*bank, *pin, *on)
                }
            };
            if code != CODE_OK {
                log::error!("[{}] step '{}' returned {}", phase, step.label(), code);
            }
            check(phase, step.command_name(), code)?;
        }
        Ok(())
    }

    fn guard(&self, phase: Phase) -> Result<()> {
        if self.context.quit.is_requested() {
            return Err(CellError::StopRequested { phase });
        }
        let safety = self.context.safety.snapshot();
        if !safety.alive() {
            return Err(CellError::SafetyStop {
                phase,
                reason: safety.reason.unwrap_or(StopReason::Shutdown),
            });
        }
        let code = self.actuator.error_code();
        if code != 0 {
            return Err(CellError::ActuatorFault { phase, code });
        }
        Ok(())
    }

    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
    }

    fn finish(&mut self) {
        self.stop_monitor();
        self.stopped = true;
        log::info!("Engine stopped after {} cycles", self.context.cycles);
    }

    fn fail(&mut self, err: CellError) -> CellError {
        self.context.quit.request();
        log::error!(
            "[{}] {} (code={}), state={}, error={}, connected={}",
            self.context.phase,
            err,
            err.code().map_or_else(|| "-".to_string(), |c| c.to_string()),
            self.actuator.state(),
            self.actuator.error_code(),
            self.actuator.is_connected()
        );
        self.stop_monitor();
        self.stopped = true;
        err
    }
}

fn check(phase: Phase, command: &str, code: i32) -> Result<()> {
    if code == CODE_OK {
        return Ok(());
    }
    Err(CellError::Command {
        phase,
        command: command.to_string(),
        code,
    })
}

fn sleep_ms(ms: u64) {
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::routine::{StackingConfig, TriggerSource};
    use crate::sim::{padded_reply, Journal, MemoryStore, Record, SimActuator, VisionStub};
    use crate::types::{ActuatorEvent, SafetyPhase};

    const SAMPLE: &str = include_str!("../config/cell.toml");

    fn test_config(stub: &VisionStub) -> CellConfig {
        let mut config = CellConfig::from_toml_str(SAMPLE).unwrap();
        config.vision.host = stub.host();
        config.vision.port = stub.port();
        config.vision.read_timeout_ms = Some(5000);
        config.vision.connect_timeout_ms = Some(5000);
        config.vision.settle_before_ms = 0;
        config.vision.settle_after_ms = 0;
        config.routine.prepare.settle_ms = 0;
        config.routine.safety.poll_interval_ms = 5;
        config.routine.trigger.source = TriggerSource::Always;
        config.routine.trigger.poll_interval_ms = 1;
        config.routine.stacking = StackingConfig {
            capacity: 3,
            slot_pitch: 55.0,
        };
        for step in config
            .routine
            .good_bin
            .place
            .iter_mut()
            .chain(config.routine.good_bin.advance.iter_mut())
        {
            if let MotionStep::Cartesian { pose, .. } = step {
                pose[1] = -80.0;
            }
        }
        config
    }

    struct Cell {
        engine: SequenceEngine<SimActuator, MemoryStore>,
        journal: Journal,
        memory: MemoryStore,
        stub: VisionStub,
    }

    fn cell(replies: Vec<Vec<u8>>, configure: impl FnOnce(SimActuator) -> SimActuator) -> Cell {
        let journal = Journal::new();
        let stub = VisionStub::start(replies, Some(journal.clone())).unwrap();
        let memory = MemoryStore::new().with_block(1, 8);
        let actuator = configure(SimActuator::new(journal.clone()));
        let engine = SequenceEngine::new(actuator, memory.clone(), test_config(&stub)).unwrap();
        Cell {
            engine,
            journal,
            memory,
            stub,
        }
    }

    fn replies(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|_| padded_reply("300.0 240.0 10.0")).collect()
    }

    fn counter(memory: &MemoryStore, offset: usize) -> u16 {
        let block = memory.block(1).unwrap();
        u16::from_be_bytes([block[offset], block[offset + 1]])
    }

    /// Cartesian targets with the given z, in journal order.
    fn cartesian_at_z(journal: &Journal, z: f64) -> Vec<[f64; 6]> {
        journal
            .entries()
            .into_iter()
            .filter_map(|r| match r {
                Record::Cartesian(p) if p[2] == z => Some(p),
                _ => None,
            })
            .collect()
    }

    fn after_last_request(journal: &Journal) -> Vec<Record> {
        let entries = journal.entries();
        let idx = entries
            .iter()
            .rposition(|r| matches!(r, Record::VisionRequest(_)))
            .unwrap();
        entries[idx + 1..].to_vec()
    }

    #[test]
    fn test_prepare_sequence() {
        let mut cell = cell(Vec::new(), |a| a);
        cell.engine.prepare().unwrap();
        let setup: Vec<Record> = cell.journal.entries();
        assert_eq!(
            setup,
            vec![
                Record::Setup("clean_warn"),
                Record::Setup("clean_error"),
                Record::Setup("motion_enable"),
                Record::Setup("set_mode"),
                Record::Setup("set_state"),
                Record::Output {
                    bank: OutputBank::Tool,
                    pin: 0,
                    on: false
                },
                Record::Setup("set_pause_time"),
            ]
        );
        assert!(cell.engine.actuator().motion_enabled());
        assert!(cell.engine.context().safety.is_running());
    }

    #[test]
    fn test_stacking_scenario() {
        let mut cell = cell(replies(4), |a| a);
        let summary = cell.engine.run_for(4).unwrap();
        assert_eq!(summary.cycles, 4);
        assert!(!summary.operator_stop);

        // Advance-slot placements for the first three cycles.
        let slots: Vec<f64> = cartesian_at_z(&cell.journal, -85.0)
            .iter()
            .map(|p| p[1])
            .collect();
        assert_eq!(slots, vec![-80.0, -25.0, 30.0]);

        // The fourth cycle found the stack full.
        let drops = cartesian_at_z(&cell.journal, -58.8);
        assert_eq!(drops.len(), 1);
        assert_eq!(counter(&cell.memory, 0), 1);
        assert_eq!(cell.stub.requests(), 4);
    }

    #[test]
    fn test_cycle_reports_counter_progression() {
        let mut cell = cell(replies(4), |a| a);
        let mut seen = Vec::new();
        for _ in 0..4 {
            match cell.engine.run_cycle().unwrap() {
                CycleOutcome::Completed(report) => {
                    seen.push((report.counter_before, report.counter_after, report.full_bin))
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(
            seen,
            vec![(0, 1, false), (1, 2, false), (2, 3, false), (3, 1, true)]
        );
        assert_eq!(cell.engine.context().cycles, 4);
    }

    #[test]
    fn test_single_flight_between_requests() {
        let mut cell = cell(replies(2), |a| a);
        cell.engine.run_for(2).unwrap();

        let entries = cell.journal.entries();
        let requests: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, Record::VisionRequest(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(requests.len(), 2);

        // Between the two requests the whole pick, place and home sequence ran.
        let between = &entries[requests[0] + 1..requests[1]];
        let z_values: Vec<f64> = between
            .iter()
            .filter_map(|r| match r {
                Record::Cartesian(p) => Some(p[2]),
                _ => None,
            })
            .collect();
        assert_eq!(z_values, vec![39.4, 39.4, -56.1, 115.8, 117.0, -85.0]);
        assert!(between.contains(&Record::Output {
            bank: OutputBank::Controller,
            pin: 0,
            on: true
        }));
    }

    #[test]
    fn test_pick_target_comes_from_calibration() {
        let mut cell = cell(vec![padded_reply("300.0 240.0 10.0")], |a| a);
        let outcome = cell.engine.run_cycle().unwrap();
        let CycleOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle");
        };
        let expected = cell
            .engine
            .routine()
            .calibration
            .to_robot_space(&Pose::new(300.0, 240.0, 10.0));
        assert_eq!(report.target, expected);

        let at_part = cartesian_at_z(&cell.journal, -56.1);
        assert_eq!(at_part[0][0], expected.x);
        assert_eq!(at_part[0][1], expected.y);
        assert_eq!(at_part[0][5], expected.r);
    }

    #[test]
    fn test_handshake_pin_brackets_request() {
        let mut cell = cell(replies(1), |a| a);
        cell.engine.run_for(1).unwrap();
        let entries = cell.journal.entries();
        let idx = entries
            .iter()
            .position(|r| matches!(r, Record::VisionRequest(_)))
            .unwrap();
        assert_eq!(
            entries[idx - 1],
            Record::Output {
                bank: OutputBank::Controller,
                pin: 1,
                on: true
            }
        );
        assert_eq!(
            entries[idx + 1],
            Record::Output {
                bank: OutputBank::Controller,
                pin: 1,
                on: false
            }
        );
    }

    #[test]
    fn test_short_reply_fails_fast() {
        let mut cell = cell(vec![b"100.0 200.0".to_vec()], |a| a);
        let err = cell.engine.run().unwrap_err();
        assert!(matches!(
            err,
            CellError::Protocol(ProtocolError::ShortRead { .. })
        ));
        assert!(after_last_request(&cell.journal).is_empty());
        assert!(cell.engine.is_stopped());
        assert!(cell.engine.stop_signal().is_requested());
    }

    #[test]
    fn test_garbled_reply_fails_fast() {
        let mut cell = cell(vec![padded_reply("1.0 2.0")], |a| a);
        let err = cell.engine.run().unwrap_err();
        assert!(matches!(
            err,
            CellError::Protocol(ProtocolError::TokenCount { found: 2, .. })
        ));
        assert!(after_last_request(&cell.journal).is_empty());
        assert_eq!(counter(&cell.memory, 0), 0);
    }

    #[test]
    fn test_no_detection_skips_cycle() {
        let mut cell = cell(vec![padded_reply("0 0 0")], |a| a);
        let summary = cell.engine.run_for(1).unwrap();
        assert_eq!(summary.cycles, 0);
        assert_eq!(summary.skipped, 1);

        let tail = after_last_request(&cell.journal);
        assert_eq!(
            tail,
            vec![Record::Output {
                bank: OutputBank::Controller,
                pin: 1,
                on: false
            }]
        );
        assert_eq!(counter(&cell.memory, 0), 0);
        let flags = cell.memory.block(1).unwrap()[6];
        assert_eq!(flags & StatusFlags::WORKING.bits(), 0);
    }

    #[test]
    fn test_command_failure_stops_run() {
        // Command 0 is the tool reset in prepare, 1..=3 are home, 4 and 5 the
        // handshake, 6 is the first approach move.
        let mut cell = cell(replies(1), |a| a.fail_command(6, 9));
        let err = cell.engine.run().unwrap_err();
        assert!(matches!(
            err,
            CellError::Command {
                phase: Phase::Approach,
                code: 9,
                ..
            }
        ));
        assert_eq!(err.code(), Some(9));
        let len_before_fail = cell.journal.len();
        assert!(!cell
            .journal
            .entries()
            .iter()
            .any(|r| matches!(r, Record::Cartesian(_))));

        assert!(matches!(cell.engine.run(), Err(CellError::AlreadyStopped)));
        assert_eq!(cell.journal.len(), len_before_fail);
        assert_eq!(
            cell.engine.context().safety.snapshot().phase,
            SafetyPhase::Stopped
        );
    }

    #[test]
    fn test_actuator_error_blocks_next_command() {
        // Command 2 is the move to the home pose.
        let mut cell = cell(replies(1), |a| {
            a.raise_after(
                2,
                ActuatorEvent::ErrorWarnChanged {
                    error_code: 22,
                    warn_code: 0,
                },
            )
        });
        let err = cell.engine.run().unwrap_err();
        assert_eq!(err.code(), Some(22));

        let joints: Vec<Record> = cell
            .journal
            .entries()
            .into_iter()
            .filter(|r| r.is_motion())
            .collect();
        assert_eq!(joints, vec![Record::Joints([0.0, -70.0, -20.0, 0.0, 90.0, 0.0])]);
        assert_eq!(cell.stub.requests(), 0);
    }

    #[test]
    fn test_scrap_routing() {
        let mut cell = cell(replies(1), |a| a);
        cell.memory
            .poke(1, 6, &[StatusFlags::ROUTINE_SCRAP.bits()])
            .unwrap();
        cell.engine.run_for(1).unwrap();

        assert_eq!(counter(&cell.memory, 3), 1);
        assert_eq!(counter(&cell.memory, 0), 0);
        let slots = cartesian_at_z(&cell.journal, -85.0);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0][0], -150.0);

        let flags = StatusFlags::from_bits_retain(cell.memory.block(1).unwrap()[6]);
        assert!(flags.contains(StatusFlags::ROUTINE_OK | StatusFlags::ROUTINE_SCRAP));
        assert!(!flags.contains(StatusFlags::WORKING));
    }

    #[test]
    fn test_plc_stop_flag_ends_run() {
        let mut cell = cell(replies(1), |a| a);
        cell.memory.poke(1, 6, &[StatusFlags::STOP.bits()]).unwrap();
        let summary = cell.engine.run().unwrap();
        assert!(summary.operator_stop);
        assert_eq!(summary.cycles, 0);
        assert_eq!(cell.stub.requests(), 0);
        assert!(matches!(cell.engine.run(), Err(CellError::AlreadyStopped)));
    }

    #[test]
    fn test_stop_signal_ends_run() {
        let mut cell = cell(replies(1), |a| a);
        cell.engine.prepare().unwrap();
        cell.engine.stop_signal().request();
        let summary = cell.engine.run().unwrap();
        assert!(summary.operator_stop);
        assert_eq!(cell.stub.requests(), 0);
    }

    #[test]
    fn test_input_trigger_is_polled() {
        let mut cell = cell(replies(1), |a| a);
        let mut config = test_config(&cell.stub);
        config.routine.trigger.source = TriggerSource::Input;
        config.routine.trigger.pin = Some(6);
        let actuator = SimActuator::new(cell.journal.clone()).with_trigger(6, [false, false, true]);
        cell.engine = SequenceEngine::new(actuator, cell.memory.clone(), config).unwrap();

        let summary = cell.engine.run_for(1).unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(cell.stub.requests(), 1);
    }

    #[test]
    fn test_store_trigger_uses_conveyor_flag() {
        let mut cell = cell(replies(1), |a| a);
        let mut config = test_config(&cell.stub);
        config.routine.trigger.source = TriggerSource::Store;
        cell.engine =
            SequenceEngine::new(SimActuator::new(cell.journal.clone()), cell.memory.clone(), config)
                .unwrap();
        cell.memory
            .poke(1, 6, &[StatusFlags::PART_ON_CONVEYOR.bits()])
            .unwrap();

        let summary = cell.engine.run_for(1).unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(counter(&cell.memory, 0), 1);
    }

    #[test]
    fn test_store_failure_stops_before_counter_skip() {
        let mut cell = cell(replies(1), |a| a);
        cell.engine.prepare().unwrap();
        cell.memory.fail_writes(true);
        let err = cell.engine.run_for(1).unwrap_err();
        assert!(matches!(err, CellError::Store(_)));
        assert_eq!(cell.stub.requests(), 0);
    }

    #[test]
    fn test_out_of_range_counter_aborts() {
        let mut cell = cell(replies(1), |a| a);
        cell.memory.poke(1, 0, &[0x00, 0x09]).unwrap();
        let err = cell.engine.run_for(1).unwrap_err();
        assert!(matches!(
            err,
            CellError::CounterOutOfRange {
                value: 9,
                capacity: 3
            }
        ));
        assert!(!cell.journal.entries().iter().any(Record::is_motion));
    }
}

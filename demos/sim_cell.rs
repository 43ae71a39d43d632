//! Run the full pick-and-place routine against simulated hardware.
//!
//! A loopback vision server answers with a few scripted poses, the arm is
//! simulated in-process and the PLC record lives in memory.
//!
//! Usage:
//!   RUST_LOG=info cargo run --example sim_cell [cycles]

use pickcell::sim::{padded_reply, Journal, MemoryStore, Record, SimActuator, VisionStub};
use pickcell::{CellConfig, CycleOutcome, PartClass, SequenceEngine};

const CONFIG: &str = include_str!("../config/cell.toml");

fn main() {
    env_logger::init();

    let cycles: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    let replies = (0..cycles)
        .map(|i| match i % 4 {
            0 => padded_reply("312.5 240.0 4.0"),
            1 => padded_reply("280.0 221.5 -12.5"),
            2 => padded_reply("0 0 0"),
            _ => padded_reply("301.0 250.0 30.0"),
        })
        .collect();

    let journal = Journal::new();
    let stub = match VisionStub::start(replies, Some(journal.clone())) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error starting vision stub: {}", e);
            std::process::exit(1);
        }
    };

    let mut config = match CellConfig::from_toml_str(CONFIG) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    config.vision.host = stub.host();
    config.vision.port = stub.port();
    config.vision.settle_before_ms = 0;
    config.vision.settle_after_ms = 0;
    config.routine.prepare.settle_ms = 0;
    config.routine.trigger.source = pickcell::routine::TriggerSource::Always;

    let memory = MemoryStore::new().with_block(config.plc.layout.block, 8);
    let actuator = SimActuator::new(journal.clone());
    let mut engine = match SequenceEngine::new(actuator, memory.clone(), config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    for i in 0..cycles {
        match engine.run_cycle() {
            Ok(CycleOutcome::Completed(report)) => println!(
                "[{}] picked at ({:.1}, {:.1}) yaw {:.1} -> slot +{:.0}mm{}  counter {} -> {}",
                i + 1,
                report.target.x,
                report.target.y,
                report.target.r,
                report.slot_offset,
                if report.full_bin { " (full bin)" } else { "" },
                report.counter_before,
                report.counter_after,
            ),
            Ok(CycleOutcome::NoDetection(_)) => println!("[{}] no part detected", i + 1),
            Err(e) => {
                eprintln!("[{}] stopped: {}", i + 1, e);
                break;
            }
        }
    }
    engine.shutdown();

    let motions = journal.entries().iter().filter(|r| r.is_motion()).count();
    let requests = journal
        .entries()
        .iter()
        .filter(|r| matches!(r, Record::VisionRequest(_)))
        .count();
    println!();
    println!("Vision requests: {}", requests);
    println!("Motion commands: {}", motions);
    match engine.counters_mut().read_counter(PartClass::Good) {
        Ok(v) => println!("Good stack:      {}", v),
        Err(e) => eprintln!("Error reading counter: {}", e),
    }
}

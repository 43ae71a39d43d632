//! Request one pose from the vision sensor and print it raw and calibrated.
//!
//! Usage:
//!   cargo run --example probe_vision [config/cell.toml]
//!
//! PICKCELL_VISION_HOST / PICKCELL_VISION_PORT override the configured endpoint.

use pickcell::{CellConfig, PoseClient};

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/cell.toml".to_string());

    let mut config = match CellConfig::from_file(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading {}: {}", path, e);
            std::process::exit(1);
        }
    };
    config.apply_env_overrides();

    let client = PoseClient::from_config(&config.vision);
    println!("Requesting pose from {}", client.endpoint());

    match client.request_pose() {
        Ok(pose) if pose.is_no_detection() => {
            println!("No part detected (r={:.2})", pose.r);
        }
        Ok(pose) => {
            let target = config.routine.calibration.to_robot_space(&pose);
            println!("Raw:        x={:.2}px  y={:.2}px  r={:.2}", pose.x, pose.y, pose.r);
            println!("Robot base: x={:.1}mm  y={:.1}mm  yaw={:.1}", target.x, target.y, target.r);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

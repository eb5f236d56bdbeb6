//! Two-Camera Fusion Demo - Terminal Walkthrough
//!
//! Two cameras watch the same crossing. Each one tracks the passing cars
//! under its own ids. The world model merger clusters the tracks by
//! geographic proximity and emits one detection per car.
//!
//! Run: `cargo run --example two_camera_demo`

use geomerger_core::geo::offset_m;
use geomerger_core::{
    Coordinate, Detection, GeoCoordinate, Merger, MergingConfig, ObjectId, SaeMessage, WorldModelMerger,
};
use geomerger_env::TokioContext;

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const GREEN: &str = "\x1b[32m";
    pub const CYAN: &str = "\x1b[36m";
    pub const YELLOW: &str = "\x1b[33m";
}

use colors::*;

const ORIGIN: Coordinate = Coordinate::new(48.7758, 9.1829);

/// (north, east, velocity north) of each car, in metres and m/s
const CARS: [(f64, f64, f64); 3] = [(-20.0, 0.0, 8.0), (-30.0, 3.5, 8.0), (25.0, -3.5, -6.0)];

fn camera_frame(camera: &str, id_base: u8, offset_east: f64, t_ms: i64) -> SaeMessage {
    let secs = t_ms as f64 / 1000.0;
    let detections = CARS
        .iter()
        .enumerate()
        .map(|(i, (north, east, vn))| Detection {
            object_id: ObjectId::new(vec![id_base + i as u8]),
            class_id: 2,
            confidence: 0.8,
            // Each camera's calibration is a little off
            geo_coordinate: GeoCoordinate::from(offset_m(&ORIGIN, north + vn * secs, east + offset_east)),
        })
        .collect();
    SaeMessage::new(camera, 1_700_000_000_000 + t_ms, detections)
}

fn main() {
    println!("{BOLD}{CYAN}Two-camera fusion demo{RESET}");
    println!("{DIM}3 cars, 2 cameras, 0.4 m calibration offset between them{RESET}\n");

    let config = MergingConfig {
        input_stream_ids: vec!["cam_north".to_string(), "cam_south".to_string()],
        ..MergingConfig::default()
    };
    let mut merger = WorldModelMerger::new(config, TokioContext::shared());

    for tick in 0..10 {
        let t_ms = tick * 100;
        for msg in [
            camera_frame("cam_north", 10, 0.0, t_ms),
            camera_frame("cam_south", 50, 0.4, t_ms + 20),
        ] {
            for (stream, out) in merger.process(Some(msg)) {
                let ids: Vec<String> = out.detections.iter().map(|d| d.object_id.to_string()).collect();
                println!(
                    "{DIM}t={:>4}ms{RESET} {YELLOW}{}{RESET} -> {} detections [{}]",
                    t_ms,
                    stream,
                    out.detections.len(),
                    ids.join(", ")
                );
            }
        }
    }

    let stats = merger.stats();
    println!("\n{BOLD}Identity forest{RESET}");
    for primary in merger.forest().inner().primaries() {
        println!("  {GREEN}{}{RESET}", primary);
    }
    println!(
        "\n{BOLD}{}{RESET} frames in, {BOLD}{}{RESET} out, {BOLD}{}{RESET} mapping changes",
        stats.frames_in, stats.frames_out, stats.mappings_changed
    );
}

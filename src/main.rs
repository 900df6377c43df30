use std::path::PathBuf;
use std::process;

use env_logger;

use rust_lane_restriction_sim::scenario;
use rust_lane_restriction_sim::ScenarioConfig;


fn main () {
    env_logger::init();

    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: rust_lane_restriction_sim <scenario.yaml>");
            process::exit(2);
        }
    };

    let result = ScenarioConfig::from_file(&config_path)
        .and_then(|config| scenario::run_scenario(&config));
    match result {
        Ok(Some(report)) => println!("{}", report),
        Ok(None) => println!("Cannot compare runs: a trip log has no valid trips"),
        Err(err) => {
            log::error!("{}", err);
            process::exit(1);
        }
    }
}

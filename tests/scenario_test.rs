use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use approx::assert_relative_eq;
use glob::glob;
use tempfile::tempdir;

use rust_lane_restriction_sim::controller::{ALL_VEHICLE_CLASSES, PRIORITY_VEHICLE_CLASSES};
use rust_lane_restriction_sim::scenario::{self, TargetSource, BLOCKED_LABEL, UNBLOCKED_LABEL};
use rust_lane_restriction_sim::ActionKind;
use rust_lane_restriction_sim::ControlChannel;
use rust_lane_restriction_sim::NetworkIndex;
use rust_lane_restriction_sim::RestrictionMode;
use rust_lane_restriction_sim::ScenarioConfig;
use rust_lane_restriction_sim::SimError;
use rust_lane_restriction_sim::SimResult;


/// A stand-in simulator that records what was asked of it.
#[derive(Default)]
struct Recorder {
    time: u32,
    lanes: HashMap<String, Vec<String>>,
    // allowed classes of every lane during each step, indexed by time
    history: Vec<HashMap<String, Vec<String>>>,
    // agent id -> (time it enters, road, lane index)
    agents: HashMap<String, (u32, String, i32)>,
    speeds: Vec<(u32, String, f64)>,
    closed: u32,
}

struct RecordingChannel {
    recorder: Rc<RefCell<Recorder>>,
}

fn unknown(kind: &str, id: &str) -> SimError {
    SimError::Command { command: 0, message: format!("{} '{}' is not known", kind, id) }
}

impl ControlChannel for RecordingChannel {
    fn simulation_step(&mut self) -> SimResult<()> {
        let mut rec = self.recorder.borrow_mut();
        let snapshot = rec.lanes.clone();
        rec.history.push(snapshot);
        rec.time += 1;
        Ok(())
    }

    fn min_expected_agents(&mut self) -> SimResult<i32> {
        Ok(0)
    }

    fn lane_allowed(&mut self, lane_id: &str) -> SimResult<Vec<String>> {
        let rec = self.recorder.borrow();
        rec.lanes.get(lane_id).cloned().ok_or_else(|| unknown("lane", lane_id))
    }

    fn set_lane_allowed(&mut self, lane_id: &str, classes: &[String]) -> SimResult<()> {
        let mut rec = self.recorder.borrow_mut();
        match rec.lanes.get_mut(lane_id) {
            Some(allowed) => {
                *allowed = classes.to_vec();
                Ok(())
            }
            None => Err(unknown("lane", lane_id)),
        }
    }

    fn agent_ids(&mut self) -> SimResult<Vec<String>> {
        let rec = self.recorder.borrow();
        Ok(rec.agents.iter()
              .filter(|(_, (enters, _, _))| *enters <= rec.time)
              .map(|(id, _)| id.clone())
              .collect())
    }

    fn agent_road_id(&mut self, agent_id: &str) -> SimResult<String> {
        let rec = self.recorder.borrow();
        rec.agents.get(agent_id).map(|(_, road, _)| road.clone())
                  .ok_or_else(|| unknown("vehicle", agent_id))
    }

    fn agent_lane_index(&mut self, agent_id: &str) -> SimResult<i32> {
        let rec = self.recorder.borrow();
        rec.agents.get(agent_id).map(|(_, _, lane)| *lane)
                  .ok_or_else(|| unknown("vehicle", agent_id))
    }

    fn set_agent_speed(&mut self, agent_id: &str, speed: f64) -> SimResult<()> {
        let mut rec = self.recorder.borrow_mut();
        if !rec.agents.contains_key(agent_id) {
            return Err(unknown("vehicle", agent_id));
        }
        let time = rec.time;
        rec.speeds.push((time, String::from(agent_id), speed));
        Ok(())
    }

    fn close(&mut self) -> SimResult<()> {
        self.recorder.borrow_mut().closed += 1;
        Ok(())
    }
}

fn to_strings(classes: &[&str]) -> Vec<String> {
    classes.iter().map(|cc| cc.to_string()).collect()
}

/// A recorder that knows every lane of the network, each open to `initial`.
fn recorder_for(index: &NetworkIndex, initial: &[&str]) -> Rc<RefCell<Recorder>> {
    let mut recorder = Recorder::default();
    for segment in index.segments() {
        for ii in 0..segment.lane_count {
            recorder.lanes.insert(format!("{}_{}", segment.id, ii), to_strings(initial));
        }
    }
    Rc::new(RefCell::new(recorder))
}

/// Loads a test scenario, sending its logs to `log_dir`.
fn load_env(config_path: &Path, log_dir: &Path) -> ScenarioConfig {
    let mut config = ScenarioConfig::from_file(config_path).unwrap();
    config.log_dir = log_dir.to_path_buf();
    config
}

fn count_csv_rows(path: &Path) -> usize {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.records().map(|rr| rr.unwrap()).count()
}

#[test]
fn test_envs_run_to_completion() {
    let mut num_envs = 0;
    for config_path in glob("tests/envs/*/config.yaml").unwrap() {
        let config_path = config_path.unwrap();
        println!("Testing {:?}", config_path);
        num_envs += 1;

        let log_dir = tempdir().unwrap();
        let config = load_env(&config_path, log_dir.path());
        let index = scenario::load_network_index(&config).unwrap();
        let recorder = recorder_for(&index, &ALL_VEHICLE_CLASSES);
        let channel_rec = recorder.clone();
        let summary = scenario::run_restricted_with(&config, &index, move || {
            Ok(RecordingChannel { recorder: channel_rec })
        }).unwrap();

        assert_eq!(summary.steps, config.end_time);
        assert_eq!(recorder.borrow().closed, 1);
        assert_eq!(recorder.borrow().history.len() as u32, config.end_time);

        let actions_path = config.run_dir(BLOCKED_LABEL).join("actions.csv");
        assert_eq!(count_csv_rows(&actions_path), summary.actions.len());
        assert!(summary.actions.iter().all(|action| action.succeeded));

        // every lane that was restricted is restored at the end of the window
        let restricts = summary.actions.iter()
                               .filter(|aa| aa.action == ActionKind::Restrict).count();
        let restores = summary.actions.iter()
                              .filter(|aa| aa.action == ActionKind::Restore).count();
        assert_eq!(restricts, restores);
        if config.restriction.mode != RestrictionMode::FreezeAgents {
            assert!(restricts > 0);
            let end = config.restriction.start_time + config.restriction.duration;
            assert!(summary.actions.iter()
                           .filter(|aa| aa.action == ActionKind::Restore)
                           .all(|aa| aa.time == end));
        }
    }
    assert!(num_envs >= 3);
}

#[test]
fn test_priority_window_on_corridor() {
    let log_dir = tempdir().unwrap();
    let config = load_env(Path::new("tests/envs/a1-corridor/config.yaml"), log_dir.path());
    let index = scenario::load_network_index(&config).unwrap();
    assert_eq!(index.segment("A1").unwrap().usage_count, 10);
    assert_eq!(index.lane_count("A1"), Some(2));

    // lanes start out open to a narrower set than the full universe
    let initial = ["passenger", "truck"];
    let recorder = recorder_for(&index, &initial);
    let channel_rec = recorder.clone();
    scenario::run_restricted_with(&config, &index, move || {
        Ok(RecordingChannel { recorder: channel_rec })
    }).unwrap();

    let recorder = recorder.borrow();
    let priority = to_strings(&PRIORITY_VEHICLE_CLASSES);
    let initial = to_strings(&initial);
    for (time, lanes) in recorder.history.iter().enumerate() {
        for lane in &["A1_0", "A1_1"] {
            let allowed = &lanes[*lane];
            if (60..360).contains(&time) {
                assert_eq!(allowed, &priority, "{} at t={}", lane, time);
            } else {
                // before the window and after it the lane allows what it did at the start
                assert_eq!(allowed, &initial, "{} at t={}", lane, time);
            }
        }
        assert_eq!(&lanes["B1_0"], &initial);
    }
}

#[test]
fn test_suggested_targets() {
    let log_dir = tempdir().unwrap();
    let config = load_env(Path::new("tests/envs/suggest-busiest/config.yaml"),
                          log_dir.path());
    assert_eq!(config.restriction.targets, TargetSource::Suggest(1));
    let index = scenario::load_network_index(&config).unwrap();
    assert_eq!(index.trip_count(), 5);

    let controller = scenario::build_controller(&config, &index).unwrap();
    let lanes: Vec<String> = controller.plan().lanes.iter().map(|ll| ll.lane_id()).collect();
    assert_eq!(lanes, vec!["N2_0".to_string(), "N2_1".to_string()]);
    assert_eq!(controller.plan().window.start, 30);
    assert_eq!(controller.plan().window.end, 75);
}

#[test]
fn test_freeze_named_agents() {
    let log_dir = tempdir().unwrap();
    let config = load_env(Path::new("tests/envs/freeze-agents/config.yaml"), log_dir.path());
    let index = scenario::load_network_index(&config).unwrap();
    let recorder = recorder_for(&index, &ALL_VEHICLE_CLASSES);
    {
        let mut rec = recorder.borrow_mut();
        rec.agents.insert("veh1".to_string(), (40, "A1".to_string(), 0));
        // on the corridor, but not on the target lane
        rec.agents.insert("veh3".to_string(), (45, "A1".to_string(), 1));
        rec.agents.insert("veh5".to_string(), (0, "A1".to_string(), 0));
    }

    let channel_rec = recorder.clone();
    let summary = scenario::run_restricted_with(&config, &index, move || {
        Ok(RecordingChannel { recorder: channel_rec })
    }).unwrap();

    let recorder = recorder.borrow();
    assert_eq!(recorder.speeds, vec![
        (40, "veh1".to_string(), 0.0),
        (90, "veh1".to_string(), -1.0),
    ]);
    // lane permissions are never touched in this mode
    assert!(recorder.history.iter().all(|lanes| lanes["A1_0"].len() == ALL_VEHICLE_CLASSES.len()));
    let kinds: Vec<ActionKind> = summary.actions.iter().map(|aa| aa.action).collect();
    assert_eq!(kinds, vec![ActionKind::Freeze, ActionKind::Release]);
}

#[test]
fn test_invalid_targets_are_config_errors() {
    let dir = tempdir().unwrap();
    let yaml = r###"
name: a1-corridor
work_dir: WORK_DIR
end_time: 400
restriction:
  mode: 1
  start_time: 60
  duration: 300
  lanes: [A1_5, Z9]
"###.replace("WORK_DIR", &PathBuf::from("tests/envs/a1-corridor").canonicalize()
                                                                    .unwrap()
                                                                    .display()
                                                                    .to_string());
    let mut config = ScenarioConfig::from_yaml_str(&yaml, dir.path()).unwrap();
    config.log_dir = dir.path().to_path_buf();
    let index = scenario::load_network_index(&config).unwrap();

    let connected = Rc::new(RefCell::new(false));
    let connected_flag = connected.clone();
    let result = scenario::run_restricted_with(&config, &index, move || {
        *connected_flag.borrow_mut() = true;
        Ok(RecordingChannel { recorder: Rc::new(RefCell::new(Recorder::default())) })
    });
    match result {
        Err(SimError::Config(_)) => (),
        other => panic!("expected a config error, got {:?}", other.map(|ss| ss.steps)),
    }
    // the simulator is never attached to
    assert!(!*connected.borrow());
}

fn write_tripinfo(path: &Path, durations: &[f64], route_length: f64) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = File::create(path).unwrap();
    writeln!(file, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>").unwrap();
    writeln!(file, "<tripinfos>").unwrap();
    for (ii, duration) in durations.iter().enumerate() {
        writeln!(file, "    <tripinfo id=\"{}\" depart=\"{}.00\" duration=\"{:.2}\" \
                        routeLength=\"{:.2}\" waitingTime=\"0.00\" vType=\"DEFAULT_VEHTYPE\"/>",
                 ii, ii, duration, route_length).unwrap();
    }
    writeln!(file, "</tripinfos>").unwrap();
}

#[test]
fn test_compare_runs() {
    let log_dir = tempdir().unwrap();
    let config = load_env(Path::new("tests/envs/a1-corridor/config.yaml"), log_dir.path());
    write_tripinfo(&config.tripinfo_file(UNBLOCKED_LABEL), &vec![120.0; 100], 1500.0);
    write_tripinfo(&config.tripinfo_file(BLOCKED_LABEL), &vec![150.0; 100], 1500.0);

    let report = scenario::compare_runs(&config).unwrap().unwrap();
    assert_eq!(report.avg_duration_s.to_string(), "+30.00 (+25.00%)");
    assert_relative_eq!(report.trip_count.absolute, 0.0);
    assert_relative_eq!(report.avg_speed_mps.unblocked, 12.5);
    assert_relative_eq!(report.avg_speed_mps.blocked, 10.0);
    assert!(report.to_string().contains("+30.00 (+25.00%)"));

    let csv_path = config.scenario_log_dir().join("comparison.csv");
    assert_eq!(count_csv_rows(&csv_path), 3);
}

#[test]
fn test_compare_runs_without_trips() {
    let log_dir = tempdir().unwrap();
    let config = load_env(Path::new("tests/envs/a1-corridor/config.yaml"), log_dir.path());
    write_tripinfo(&config.tripinfo_file(UNBLOCKED_LABEL), &[100.0, 80.0], 900.0);
    write_tripinfo(&config.tripinfo_file(BLOCKED_LABEL), &[], 900.0);

    assert!(scenario::compare_runs(&config).unwrap().is_none());
    assert!(!config.scenario_log_dir().join("comparison.csv").exists());
}

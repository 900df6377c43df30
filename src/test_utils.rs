use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::rc::Rc;

use crate::error::{SimError, SimResult};
use crate::traci::ControlChannel;


/// Checks that the contents of two hashmaps are the same.
pub fn compare_hashmaps<KK, VV>(query_map: &HashMap<KK, VV>, true_map: &HashMap<KK, VV>)
    where KK: Debug + Eq + std::hash::Hash,
    VV: Debug + PartialEq,
{
    assert_eq!(query_map.len(), true_map.len());

    for (true_key, true_val) in true_map {
        match query_map.get(true_key) {
            Some(val) => assert_eq!(val, true_val),
            None => assert!(false, "Key {:?} missing!", true_key),
        }
    }
}

pub struct MockAgent {
    pub appears_at: u32,
    pub road_id: String,
    pub lane_index: i32,
}

/// What a scripted simulator saw and did; shared with the test after the channel is moved
/// into the controller.
#[derive(Default)]
pub struct MockState {
    // current simulation time, i.e. the number of completed steps
    pub steps: u32,
    pub lanes: HashMap<String, Vec<String>>,
    // (time, lane id, classes) for every successful lane update
    pub lane_sets: Vec<(u32, String, Vec<String>)>,
    pub watch_lane: Option<String>,
    // allowed classes of the watched lane during each step
    pub watched: Vec<Vec<String>>,
    pub failing_lanes: HashSet<String>,
    // lanes whose permissions cannot be read back
    pub unreadable_lanes: HashSet<String>,
    pub agents: HashMap<String, MockAgent>,
    pub speed_sets: Vec<(u32, String, f64)>,
    // vehicles are reported as pending until this time
    pub demand_until: u32,
    pub fail_step_at: Option<u32>,
    pub panic_step_at: Option<u32>,
    pub close_calls: u32,
}

impl MockState {
    pub fn add_agent(&mut self, id: &str, appears_at: u32, road_id: &str, lane_index: i32) {
        self.agents.insert(String::from(id), MockAgent {
            appears_at,
            road_id: String::from(road_id),
            lane_index,
        });
    }

    fn agent(&self, id: &str) -> SimResult<&MockAgent> {
        match self.agents.get(id) {
            Some(agent) if agent.appears_at <= self.steps => Ok(agent),
            _ => Err(SimError::Command {
                command: 0xa4,
                message: format!("Vehicle '{}' is not known", id),
            }),
        }
    }
}

pub struct MockChannel {
    state: Rc<RefCell<MockState>>,
}

impl MockChannel {
    pub fn new(lanes: &[&str], classes: &[String]) -> (MockChannel, Rc<RefCell<MockState>>) {
        let mut state = MockState::default();
        for lane in lanes {
            state.lanes.insert(lane.to_string(), classes.to_vec());
        }
        let state = Rc::new(RefCell::new(state));
        (MockChannel { state: state.clone() }, state)
    }
}

impl ControlChannel for MockChannel {
    fn simulation_step(&mut self) -> SimResult<()> {
        let panic_now = {
            let state = self.state.borrow();
            state.panic_step_at == Some(state.steps)
        };
        if panic_now {
            panic!("simulator crashed mid-step");
        }
        let mut state = self.state.borrow_mut();
        if state.fail_step_at == Some(state.steps) {
            return Err(SimError::Transport("connection reset".to_string()));
        }
        if let Some(lane) = state.watch_lane.clone() {
            let allowed = state.lanes.get(&lane).cloned().unwrap_or_default();
            state.watched.push(allowed);
        }
        state.steps += 1;
        Ok(())
    }

    fn min_expected_agents(&mut self) -> SimResult<i32> {
        let state = self.state.borrow();
        Ok(if state.steps < state.demand_until { 1 } else { 0 })
    }

    fn lane_allowed(&mut self, lane_id: &str) -> SimResult<Vec<String>> {
        let state = self.state.borrow();
        match state.lanes.get(lane_id) {
            Some(allowed) if !state.unreadable_lanes.contains(lane_id) => Ok(allowed.clone()),
            _ => Err(SimError::Command {
                command: 0xa3,
                message: format!("Lane '{}' is not known", lane_id),
            }),
        }
    }

    fn set_lane_allowed(&mut self, lane_id: &str, classes: &[String]) -> SimResult<()> {
        let mut state = self.state.borrow_mut();
        if state.failing_lanes.contains(lane_id) || !state.lanes.contains_key(lane_id) {
            return Err(SimError::Command {
                command: 0xc3,
                message: format!("Lane '{}' is not known", lane_id),
            });
        }
        let time = state.steps;
        state.lanes.insert(String::from(lane_id), classes.to_vec());
        state.lane_sets.push((time, String::from(lane_id), classes.to_vec()));
        Ok(())
    }

    fn agent_ids(&mut self) -> SimResult<Vec<String>> {
        let state = self.state.borrow();
        let mut ids: Vec<String> = state.agents.iter()
                                        .filter(|(_, agent)| agent.appears_at <= state.steps)
                                        .map(|(id, _)| id.clone())
                                        .collect();
        ids.sort();
        Ok(ids)
    }

    fn agent_road_id(&mut self, agent_id: &str) -> SimResult<String> {
        let state = self.state.borrow();
        Ok(state.agent(agent_id)?.road_id.clone())
    }

    fn agent_lane_index(&mut self, agent_id: &str) -> SimResult<i32> {
        let state = self.state.borrow();
        Ok(state.agent(agent_id)?.lane_index)
    }

    fn set_agent_speed(&mut self, agent_id: &str, speed: f64) -> SimResult<()> {
        let mut state = self.state.borrow_mut();
        state.agent(agent_id)?;
        let time = state.steps;
        state.speed_sets.push((time, String::from(agent_id), speed));
        Ok(())
    }

    fn close(&mut self) -> SimResult<()> {
        self.state.borrow_mut().close_calls += 1;
        Ok(())
    }
}

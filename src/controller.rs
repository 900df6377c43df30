// The live restriction controller: applies, holds and reverts a lane restriction while stepping
// a simulation over its control channel.
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::error::{SimError, SimResult};
use super::network_index::NetworkIndex;
use super::targets::{LaneRef, LaneTarget};
use super::traci::ControlChannel;


/// Every vehicle class the simulator recognizes.
pub static ALL_VEHICLE_CLASSES: [&str; 26] = [
    "private", "emergency", "authority", "army", "vip", "pedestrian", "passenger", "hov", "taxi",
    "bus", "coach", "delivery", "truck", "trailer", "motorcycle", "moped", "bicycle", "evehicle",
    "tram", "rail_urban", "rail", "rail_electric", "rail_fast", "ship", "custom1", "custom2",
];

/// Classes that keep access to a lane restricted to priority traffic.
pub static PRIORITY_VEHICLE_CLASSES: [&str; 3] = ["emergency", "authority", "army"];

// speed that hands a vehicle back to the simulator's own model
const UNCONTROLLED_SPEED: f64 = -1.0;


#[derive(PartialEq, Debug, Clone)]
pub struct VehicleClasses {
    all: Vec<String>,
    priority: Vec<String>,
}

impl VehicleClasses {
    pub fn new(all: &[&str], priority: &[&str]) -> SimResult<VehicleClasses> {
        if let Some(unknown) = priority.iter().find(|pp| !all.contains(*pp)) {
            return Err(SimError::config(format!(
                "priority class '{}' is not in the class universe", unknown)));
        }
        Ok(VehicleClasses {
            all: all.iter().map(|ss| ss.to_string()).collect(),
            priority: priority.iter().map(|ss| ss.to_string()).collect(),
        })
    }

    pub fn all(&self) -> &[String] {
        &self.all
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }

    pub fn without_priority(&self) -> Vec<String> {
        self.all.iter().filter(|cc| !self.priority.contains(*cc)).cloned().collect()
    }
}

impl Default for VehicleClasses {
    fn default() -> VehicleClasses {
        VehicleClasses {
            all: ALL_VEHICLE_CLASSES.iter().map(|ss| ss.to_string()).collect(),
            priority: PRIORITY_VEHICLE_CLASSES.iter().map(|ss| ss.to_string()).collect(),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum RestrictionMode {
    // only priority classes may use the lanes
    PriorityOnly,
    // everything but the priority classes may use the lanes
    ExcludePriority,
    // named vehicles are stopped when found on the lanes
    FreezeAgents,
}

impl FromStr for RestrictionMode {
    type Err = SimError;

    fn from_str(ss: &str) -> SimResult<RestrictionMode> {
        match ss.trim().to_lowercase().as_str() {
            "1" | "priority_only" => Ok(RestrictionMode::PriorityOnly),
            "2" | "exclude_priority" => Ok(RestrictionMode::ExcludePriority),
            "3" | "freeze_agents" => Ok(RestrictionMode::FreezeAgents),
            other => Err(SimError::config(format!("unknown restriction mode '{}'", other))),
        }
    }
}

/// The simulation-time interval [start, end) during which the restriction holds.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct RestrictionWindow {
    pub start: u32,
    pub end: u32,
}

impl RestrictionWindow {
    pub fn new(start: u32, duration: u32) -> SimResult<RestrictionWindow> {
        if duration == 0 {
            return Err(SimError::config("restriction duration must be positive"));
        }
        let end = start.checked_add(duration).ok_or_else(|| {
            SimError::config("restriction window ends beyond the representable time range")
        })?;
        Ok(RestrictionWindow { start, end })
    }

    pub fn contains(&self, time: u32) -> bool {
        self.start <= time && time < self.end
    }
}

/// Everything the controller needs to know about what to restrict, fixed before a run.
#[derive(Debug, Clone)]
pub struct RestrictionPlan {
    pub mode: RestrictionMode,
    pub window: RestrictionWindow,
    pub targets: Vec<LaneTarget>,
    // the targets expanded into concrete lanes
    pub lanes: Vec<LaneRef>,
    pub agents: Vec<String>,
}

impl RestrictionPlan {
    pub fn new(mode: RestrictionMode, window: RestrictionWindow, targets: Vec<LaneTarget>,
               index: &NetworkIndex, agents: Vec<String>) -> RestrictionPlan {
        let lanes = targets.iter().flat_map(|target| target.expand(index)).collect();
        RestrictionPlan { mode, window, targets, lanes, agents }
    }
}


#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ActionKind {
    Restrict,
    Restore,
    Freeze,
    Release,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Restrict => "restrict",
            ActionKind::Restore => "restore",
            ActionKind::Freeze => "freeze",
            ActionKind::Release => "release",
        };
        write!(f, "{}", name)
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct ActionRecord {
    pub time: u32,
    // a lane id or an agent id
    pub target: String,
    pub action: ActionKind,
    pub succeeded: bool,
    pub detail: String,
}

fn record_action(actions: &mut Vec<ActionRecord>, time: u32, target: &str, action: ActionKind,
                 result: &SimResult<()>) {
    let (succeeded, detail) = match result {
        Ok(()) => {
            log::info!("t={} {} {}", time, action, target);
            (true, String::new())
        }
        Err(err) => {
            log::warn!("t={} could not {} {}: {}", time, action, target, err);
            (false, err.to_string())
        }
    };
    actions.push(ActionRecord {
        time,
        target: String::from(target),
        action,
        succeeded,
        detail,
    });
}

pub fn write_actions_csv(actions: &[ActionRecord], path: &Path) -> SimResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&["time", "target", "action", "succeeded", "detail"])?;
    for action in actions {
        writer.write_record(&[
            action.time.to_string(),
            action.target.clone(),
            action.action.to_string(),
            action.succeeded.to_string(),
            action.detail.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}


/// The per-step interface every restriction strategy implements.
trait StepHook {
    fn on_start(&mut self, time: u32, channel: &mut dyn ControlChannel,
                actions: &mut Vec<ActionRecord>);
    fn on_tick(&mut self, time: u32, channel: &mut dyn ControlChannel,
               actions: &mut Vec<ActionRecord>);
    fn on_end(&mut self, time: u32, channel: &mut dyn ControlChannel,
              actions: &mut Vec<ActionRecord>);
}

/// Swaps the allowed classes of a set of lanes for the window's duration.
struct LaneClassRestriction {
    lanes: Vec<LaneRef>,
    allowed: Vec<String>,
    // lanes whose restriction went through, with the classes they allowed beforehand
    restricted: Vec<(LaneRef, Vec<String>)>,
}

impl StepHook for LaneClassRestriction {
    fn on_start(&mut self, time: u32, channel: &mut dyn ControlChannel,
                actions: &mut Vec<ActionRecord>) {
        for lane in &self.lanes {
            // a lane listed twice must not record its restricted set as the prior one
            if self.restricted.iter().any(|(done, _)| done == lane) {
                continue;
            }
            let lane_id = lane.lane_id();
            let prior = match channel.lane_allowed(&lane_id) {
                Ok(prior) => prior,
                Err(err) => {
                    // without the prior set the lane could not be put back, so leave it alone
                    record_action(actions, time, &lane_id, ActionKind::Restrict, &Err(err));
                    continue;
                }
            };
            let result = channel.set_lane_allowed(&lane_id, &self.allowed);
            if result.is_ok() {
                self.restricted.push((lane.clone(), prior));
            }
            record_action(actions, time, &lane_id, ActionKind::Restrict, &result);
        }
    }

    fn on_tick(&mut self, _time: u32, _channel: &mut dyn ControlChannel,
               _actions: &mut Vec<ActionRecord>) {}

    fn on_end(&mut self, time: u32, channel: &mut dyn ControlChannel,
              actions: &mut Vec<ActionRecord>) {
        for (lane, prior) in std::mem::take(&mut self.restricted) {
            let lane_id = lane.lane_id();
            let result = channel.set_lane_allowed(&lane_id, &prior);
            record_action(actions, time, &lane_id, ActionKind::Restore, &result);
        }
    }
}

/// Stops named vehicles found on the target lanes and lets them go when the window closes.
struct AgentFreeze {
    agents: Vec<String>,
    targets: Vec<LaneTarget>,
    frozen: BTreeSet<String>,
}

impl AgentFreeze {
    fn is_on_target(&self, agent_id: &str, channel: &mut dyn ControlChannel) -> SimResult<bool> {
        let road_id = channel.agent_road_id(agent_id)?;
        let lane_index = channel.agent_lane_index(agent_id)?;
        Ok(self.targets.iter().any(|target| target.matches(&road_id, lane_index)))
    }
}

impl StepHook for AgentFreeze {
    fn on_start(&mut self, time: u32, _channel: &mut dyn ControlChannel,
                _actions: &mut Vec<ActionRecord>) {
        // lane permissions stay as they are in this mode
        log::info!("t={} watching {} agent(s) on {} target(s)", time, self.agents.len(),
                   self.targets.len());
    }

    fn on_tick(&mut self, time: u32, channel: &mut dyn ControlChannel,
               actions: &mut Vec<ActionRecord>) {
        if self.frozen.len() == self.agents.len() {
            return;
        }
        let present: HashSet<String> = match channel.agent_ids() {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) => {
                log::warn!("t={} could not list agents: {}", time, err);
                return;
            }
        };

        for agent_id in &self.agents {
            if self.frozen.contains(agent_id) || !present.contains(agent_id) {
                continue;
            }
            match self.is_on_target(agent_id, channel) {
                Ok(true) => {
                    let result = channel.set_agent_speed(agent_id, 0.0);
                    if result.is_ok() {
                        self.frozen.insert(agent_id.clone());
                    }
                    record_action(actions, time, agent_id, ActionKind::Freeze, &result);
                }
                Ok(false) => {}
                Err(err) => log::warn!("t={} could not locate {}: {}", time, agent_id, err),
            }
        }
    }

    fn on_end(&mut self, time: u32, channel: &mut dyn ControlChannel,
              actions: &mut Vec<ActionRecord>) {
        for agent_id in std::mem::take(&mut self.frozen) {
            let result = channel.set_agent_speed(&agent_id, UNCONTROLLED_SPEED);
            record_action(actions, time, &agent_id, ActionKind::Release, &result);
        }
    }
}

/// One variant per restriction mode, chosen once when the controller is armed.
enum RestrictionStrategy {
    PriorityOnly(LaneClassRestriction),
    ExcludePriority(LaneClassRestriction),
    FreezeAgents(AgentFreeze),
}

impl RestrictionStrategy {
    fn for_plan(plan: &RestrictionPlan, classes: &VehicleClasses) -> RestrictionStrategy {
        let lane_restriction = |allowed: Vec<String>| LaneClassRestriction {
            lanes: plan.lanes.clone(),
            allowed,
            restricted: vec![],
        };
        match plan.mode {
            RestrictionMode::PriorityOnly => RestrictionStrategy::PriorityOnly(
                lane_restriction(classes.priority().to_vec())),
            RestrictionMode::ExcludePriority => RestrictionStrategy::ExcludePriority(
                lane_restriction(classes.without_priority())),
            RestrictionMode::FreezeAgents => RestrictionStrategy::FreezeAgents(AgentFreeze {
                agents: plan.agents.clone(),
                targets: plan.targets.clone(),
                frozen: BTreeSet::new(),
            }),
        }
    }

    fn hook(&mut self) -> &mut dyn StepHook {
        match self {
            RestrictionStrategy::PriorityOnly(hook) => hook as &mut dyn StepHook,
            RestrictionStrategy::ExcludePriority(hook) => hook as &mut dyn StepHook,
            RestrictionStrategy::FreezeAgents(hook) => hook as &mut dyn StepHook,
        }
    }
}


/// Owns an open control channel and closes it exactly once, whichever way the run ends.
struct Session<C: ControlChannel> {
    channel: C,
    open: bool,
}

impl<C: ControlChannel> Session<C> {
    fn open(channel: C) -> Session<C> {
        Session { channel, open: true }
    }

    fn channel(&mut self) -> &mut C {
        &mut self.channel
    }

    fn close(&mut self) -> SimResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.channel.close()
    }
}

impl<C: ControlChannel> Drop for Session<C> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("Failed to close control channel: {}", err);
        }
    }
}


#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ControllerState {
    Idle,
    Connected,
    Armed,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    // number of simulation steps advanced
    pub steps: u32,
    pub actions: Vec<ActionRecord>,
}

pub struct RestrictionController {
    plan: RestrictionPlan,
    classes: VehicleClasses,
    state: ControllerState,
    actions: Vec<ActionRecord>,
    progress_interval: u32,
}

impl RestrictionController {
    /// Checks the plan; configuration problems are reported here, before any channel exists.
    pub fn new(plan: RestrictionPlan, classes: VehicleClasses)
               -> SimResult<RestrictionController> {
        if plan.targets.is_empty() {
            return Err(SimError::config("no valid lane targets to restrict"));
        }
        if plan.lanes.is_empty() {
            return Err(SimError::config("lane targets do not resolve to any lane"));
        }
        if plan.window.end <= plan.window.start {
            return Err(SimError::config(format!("restriction window [{}, {}) is empty",
                                                plan.window.start, plan.window.end)));
        }
        if plan.mode == RestrictionMode::FreezeAgents && plan.agents.is_empty() {
            return Err(SimError::config("agent-freeze mode needs at least one named agent"));
        }

        Ok(RestrictionController {
            plan,
            classes,
            state: ControllerState::Idle,
            actions: vec![],
            progress_interval: 5000,
        })
    }

    pub fn with_progress_interval(mut self, progress_interval: u32) -> RestrictionController {
        self.progress_interval = progress_interval;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn plan(&self) -> &RestrictionPlan {
        &self.plan
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    /// Attaches through `connect`, then steps the simulation until no vehicles are left and
    /// `horizon` steps have run, restricting the planned lanes during the window.
    pub fn run<C, F>(&mut self, connect: F, horizon: u32) -> SimResult<RunSummary>
        where C: ControlChannel, F: FnOnce() -> SimResult<C>
    {
        if self.state != ControllerState::Idle {
            return Err(SimError::config("a restriction controller can only run once"));
        }
        if self.plan.window.start >= horizon {
            log::warn!("Restriction starts at t={}, at or after the horizon t={}",
                       self.plan.window.start, horizon);
        }

        let mut session = Session::open(connect()?);
        self.state = ControllerState::Connected;

        let mut strategy = RestrictionStrategy::for_plan(&self.plan, &self.classes);
        self.state = ControllerState::Armed;
        log::info!("Armed: {:?} on {} lane(s), t=[{}, {})", self.plan.mode,
                   self.plan.lanes.len(), self.plan.window.start, self.plan.window.end);

        let loop_result = self.step_loop(session.channel(), &mut strategy, horizon);
        let close_result = session.close();
        self.state = ControllerState::Closed;

        let steps = match (loop_result, close_result) {
            (Ok(steps), Ok(())) => steps,
            (Ok(_), Err(err)) => return Err(err),
            (Err(err), close_result) => {
                if let Err(close_err) = close_result {
                    log::error!("Failed to close control channel: {}", close_err);
                }
                return Err(err);
            }
        };

        log::info!("Controlled run finished after {} steps", steps);
        Ok(RunSummary {
            steps,
            actions: self.actions.clone(),
        })
    }

    fn step_loop(&mut self, channel: &mut dyn ControlChannel, strategy: &mut RestrictionStrategy,
                 horizon: u32) -> SimResult<u32> {
        let window = self.plan.window;
        let mut step: u32 = 0;
        let mut started = false;
        let mut ended = false;

        // keep going while there is time left or vehicles still to finish
        while step < horizon || channel.min_expected_agents()? > 0 {
            if step == window.start && !started {
                strategy.hook().on_start(step, channel, &mut self.actions);
                started = true;
                self.state = ControllerState::Active;
            }
            if started && !ended && window.contains(step) {
                strategy.hook().on_tick(step, channel, &mut self.actions);
            }
            if step == window.end && started && !ended {
                strategy.hook().on_end(step, channel, &mut self.actions);
                ended = true;
            }

            channel.simulation_step()?;

            if self.progress_interval > 0 && step > 0 && step % self.progress_interval == 0 {
                let restricted = started && !ended;
                match channel.min_expected_agents() {
                    Ok(expected) => log::info!("Step {} | expected vehicles: {} | restricted: {}",
                                               step, expected, restricted),
                    Err(err) => log::warn!("Step {} | could not query vehicles: {}", step, err),
                }
            }
            step += 1;
        }

        if started && !ended {
            log::warn!("Run ended at t={} before the restriction window closed at t={}",
                       step, window.end);
        }
        Ok(step)
    }
}

// The end-to-end scenario: prepare inputs, run the baseline and the restricted simulation, and
// compare the two.
use std::convert::TryFrom;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use itertools::Itertools;
use yaml_rust::{Yaml, YamlLoader};

use super::config_utils;
use super::controller::{write_actions_csv, RestrictionController, RestrictionMode,
                        RestrictionPlan, RestrictionWindow, RunSummary, VehicleClasses};
use super::error::{SimError, SimResult};
use super::metrics::{self, ComparisonReport};
use super::network_index::NetworkIndex;
use super::targets;
use super::traci::{resolve_binary, ControlChannel, SumoLauncher};


pub const UNBLOCKED_LABEL: &str = "unblocked";
pub const BLOCKED_LABEL: &str = "blocked";

const TRIPINFO_FILE: &str = "tripinfo_output.xml";
const SUMMARY_FILE: &str = "summary_output.xml";
const ACTIONS_FILE: &str = "actions.csv";
const COMPARISON_FILE: &str = "comparison.csv";


#[derive(PartialEq, Debug, Clone)]
pub struct GenerateConfig {
    pub osm_file: PathBuf,
    // seconds between generated trip departures
    pub period: f64,
    // polygon type map; defaults to the one shipped under $SUMO_HOME
    pub typemap: Option<PathBuf>,
}

#[derive(PartialEq, Debug, Clone)]
pub enum TargetSource {
    Lanes(Vec<String>),
    // block the n most-used segments
    Suggest(usize),
}

#[derive(PartialEq, Debug, Clone)]
pub struct RestrictionConfig {
    pub mode: RestrictionMode,
    pub start_time: u32,
    pub duration: u32,
    pub targets: TargetSource,
    pub agents: Vec<String>,
}

#[derive(PartialEq, Debug, Clone)]
pub struct TraciConfig {
    pub port: Option<u16>,
    pub attach_retries: u32,
    pub progress_interval: u32,
}

impl Default for TraciConfig {
    fn default() -> TraciConfig {
        TraciConfig {
            port: None,
            attach_retries: 60,
            progress_interval: 5000,
        }
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct ScenarioConfig {
    pub name: String,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub sumo_binary: String,
    // the simulation horizon in seconds
    pub end_time: u32,
    pub generate: Option<GenerateConfig>,
    pub restriction: RestrictionConfig,
    pub traci: TraciConfig,
}

fn yaml_str<'a>(yaml: &'a Yaml, key: &str) -> SimResult<Option<&'a str>> {
    let value = &yaml[key];
    if value.is_badvalue() || value.is_null() {
        return Ok(None);
    }
    match value.as_str() {
        Some(ss) => Ok(Some(ss)),
        None => Err(SimError::config(format!("'{}' must be a string, got {:?}", key, value))),
    }
}

fn yaml_u64(yaml: &Yaml, key: &str) -> SimResult<Option<u64>> {
    let value = &yaml[key];
    if value.is_badvalue() || value.is_null() {
        return Ok(None);
    }
    match value.as_i64() {
        Some(ii) if ii >= 0 => Ok(Some(ii as u64)),
        _ => Err(SimError::config(format!("'{}' must be a non-negative integer, got {:?}",
                                          key, value))),
    }
}

fn yaml_u32(yaml: &Yaml, key: &str) -> SimResult<Option<u32>> {
    match yaml_u64(yaml, key)? {
        Some(value) => u32::try_from(value).map(Some).map_err(|_| {
            SimError::config(format!("'{}' is too large: {}", key, value))
        }),
        None => Ok(None),
    }
}

fn parse_restriction(yaml: &Yaml) -> SimResult<RestrictionConfig> {
    if yaml.is_badvalue() {
        return Err(SimError::config("missing 'restriction' section"));
    }
    let mode: RestrictionMode = match &yaml["mode"] {
        Yaml::Integer(ii) => ii.to_string().parse()?,
        Yaml::String(ss) => ss.parse()?,
        other => return Err(SimError::config(format!("'mode' is missing or invalid: {:?}",
                                                     other))),
    };
    let start_time = config_utils::yaml_time_s(yaml, "start_time")?
        .ok_or_else(|| SimError::config("missing restriction 'start_time'"))?;
    let duration = config_utils::yaml_time_s(yaml, "duration")?
        .ok_or_else(|| SimError::config("missing restriction 'duration'"))?;

    let lanes = config_utils::yaml_string_list(yaml, "lanes")?;
    let targets = match yaml_u32(yaml, "suggest")? {
        Some(_) if !lanes.is_empty() => {
            return Err(SimError::config("give either 'lanes' or 'suggest', not both"));
        }
        Some(0) => return Err(SimError::config("'suggest' must be at least 1")),
        Some(nn) => TargetSource::Suggest(nn as usize),
        None if lanes.is_empty() => {
            return Err(SimError::config("restriction needs 'lanes' or 'suggest'"));
        }
        None => TargetSource::Lanes(lanes),
    };

    Ok(RestrictionConfig {
        mode,
        start_time,
        duration,
        targets,
        agents: config_utils::yaml_string_list(yaml, "agents")?,
    })
}

fn parse_traci(yaml: &Yaml) -> SimResult<TraciConfig> {
    let mut traci = TraciConfig::default();
    if yaml.is_badvalue() {
        return Ok(traci);
    }
    if let Some(port) = yaml_u64(yaml, "port")? {
        if port == 0 || port > u16::max_value() as u64 {
            return Err(SimError::config(format!("invalid TraCI port {}", port)));
        }
        traci.port = Some(port as u16);
    }
    if let Some(retries) = yaml_u32(yaml, "attach_retries")? {
        traci.attach_retries = retries;
    }
    if let Some(interval) = yaml_u32(yaml, "progress_interval")? {
        traci.progress_interval = interval;
    }
    Ok(traci)
}

fn parse_generate(yaml: &Yaml, base_dir: &Path) -> SimResult<Option<GenerateConfig>> {
    if yaml.is_badvalue() || yaml.is_null() {
        return Ok(None);
    }
    let osm_file = yaml_str(yaml, "osm_file")?
        .ok_or_else(|| SimError::config("'generate' needs an 'osm_file'"))?;
    let period = match &yaml["period"] {
        Yaml::Integer(ii) => *ii as f64,
        real @ Yaml::Real(_) => real.as_f64().unwrap_or(0.0),
        Yaml::BadValue | Yaml::Null => 1.0,
        other => return Err(SimError::config(format!("invalid 'period': {:?}", other))),
    };
    if period <= 0.0 {
        return Err(SimError::config("trip generation 'period' must be positive"));
    }
    Ok(Some(GenerateConfig {
        osm_file: config_utils::str_to_absolute_path(osm_file, base_dir),
        period,
        typemap: yaml_str(yaml, "typemap")?
            .map(|tm| config_utils::str_to_absolute_path(tm, base_dir)),
    }))
}

impl ScenarioConfig {
    pub fn from_file(config_path: &Path) -> SimResult<ScenarioConfig> {
        let file_contents = fs::read_to_string(config_path).map_err(|err| {
            SimError::config(format!("could not read {}: {}", config_path.display(), err))
        })?;
        // the simulator reads paths in a .sumocfg relative to that file, so keep ours absolute
        let config_path = fs::canonicalize(config_path)?;
        let config_dir = match config_path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("/"),
        };
        ScenarioConfig::from_yaml_str(&file_contents, &config_dir)
    }

    /// Relative paths in the yaml are taken relative to `config_dir`.
    pub fn from_yaml_str(contents: &str, config_dir: &Path) -> SimResult<ScenarioConfig> {
        let yaml_cfgs = YamlLoader::load_from_str(contents)
            .map_err(|err| SimError::config(format!("invalid yaml: {}", err)))?;
        let yaml_cfg = match yaml_cfgs.first() {
            Some(cfg) => cfg,
            None => return Err(SimError::config("the scenario file is empty")),
        };

        let name = yaml_str(yaml_cfg, "name")?
            .ok_or_else(|| SimError::config("missing scenario 'name'"))?;
        if name.trim().is_empty() {
            return Err(SimError::config("scenario 'name' is empty"));
        }
        let work_dir = match yaml_str(yaml_cfg, "work_dir")? {
            Some(dir) => config_utils::str_to_absolute_path(dir, config_dir),
            None => config_dir.to_path_buf(),
        };
        let log_dir = yaml_str(yaml_cfg, "log_dir")?.unwrap_or("scenario_logs");
        let end_time = config_utils::yaml_time_s(yaml_cfg, "end_time")?
            .ok_or_else(|| SimError::config("missing 'end_time'"))?;

        Ok(ScenarioConfig {
            name: String::from(name.trim()),
            log_dir: config_utils::str_to_absolute_path(log_dir, &work_dir),
            work_dir,
            sumo_binary: String::from(yaml_str(yaml_cfg, "sumo_binary")?.unwrap_or("sumo")),
            end_time,
            generate: parse_generate(&yaml_cfg["generate"], config_dir)?,
            restriction: parse_restriction(&yaml_cfg["restriction"])?,
            traci: parse_traci(&yaml_cfg["traci"])?,
        })
    }

    fn input_file(&self, suffix: &str) -> PathBuf {
        self.work_dir.join(format!("{}.{}", self.name, suffix))
    }

    pub fn net_file(&self) -> PathBuf {
        self.input_file("net.xml")
    }

    pub fn route_file(&self) -> PathBuf {
        self.input_file("rou.xml")
    }

    pub fn poly_file(&self) -> PathBuf {
        self.input_file("poly.xml")
    }

    pub fn trip_file(&self) -> PathBuf {
        self.input_file("trip.xml")
    }

    pub fn scenario_log_dir(&self) -> PathBuf {
        self.log_dir.join(&self.name)
    }

    pub fn run_dir(&self, label: &str) -> PathBuf {
        self.scenario_log_dir().join(label)
    }

    pub fn tripinfo_file(&self, label: &str) -> PathBuf {
        self.run_dir(label).join(TRIPINFO_FILE)
    }
}


/// Runs an external tool to completion. A non-zero exit is reported with its stderr.
pub fn run_command(program: &str, args: &[String], tool: &str) -> SimResult<()> {
    log::info!("Running {}: {} {}", tool, program, args.iter().join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SimError::ExecutableNotFound {
                binary: String::from(program),
            },
            _ => SimError::Io(err),
        })?;

    if !output.status.success() {
        return Err(SimError::Tool {
            tool: String::from(tool),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    log::info!("{} finished", tool);
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Builds the network, polygons, trips and routes from the configured map extract.
pub fn generate_inputs(config: &ScenarioConfig, generate: &GenerateConfig) -> SimResult<()> {
    if !generate.osm_file.is_file() {
        return Err(SimError::config(format!("map file {} does not exist",
                                            generate.osm_file.display())));
    }
    let sumo_home = std::env::var_os("SUMO_HOME").map(PathBuf::from);
    fs::create_dir_all(&config.work_dir)?;

    let osm = path_arg(&generate.osm_file);
    let net = path_arg(&config.net_file());
    run_command("netconvert", &[
        "--osm-files".to_string(), osm.clone(), "-o".to_string(), net.clone(),
    ], "netconvert")?;

    let typemap = match (&generate.typemap, &sumo_home) {
        (Some(typemap), _) => Some(typemap.clone()),
        (None, Some(home)) => Some(home.join("data").join("typemap")
                                       .join("osmPolyconvert.typ.xml")),
        (None, None) => None,
    };
    match typemap {
        Some(typemap) => run_command("polyconvert", &[
            "--osm-files".to_string(), osm,
            "--type-file".to_string(), path_arg(&typemap),
            "-o".to_string(), path_arg(&config.poly_file()),
        ], "polyconvert")?,
        None => log::warn!("No polygon type map and SUMO_HOME is unset; skipping polygons"),
    }

    let random_trips = match &sumo_home {
        Some(home) => home.join("tools").join("randomTrips.py"),
        None => return Err(SimError::config("SUMO_HOME must be set to generate trips")),
    };
    let trips = path_arg(&config.trip_file());
    run_command("python3", &[
        path_arg(&random_trips),
        "-n".to_string(), net.clone(),
        "-o".to_string(), trips.clone(),
        "-e".to_string(), config.end_time.to_string(),
        "-p".to_string(), generate.period.to_string(),
        "--validate".to_string(),
    ], "randomTrips")?;

    run_command("duarouter", &[
        "-n".to_string(), net,
        "-t".to_string(), trips,
        "-o".to_string(), path_arg(&config.route_file()),
        "--ignore-errors".to_string(),
    ], "duarouter")
}

/// Writes the simulator configuration for one run, pointing its outputs at the run's log
/// directory, and returns its path.
pub fn write_sumocfg(config: &ScenarioConfig, label: &str) -> SimResult<PathBuf> {
    let run_dir = config.run_dir(label);
    fs::create_dir_all(&run_dir)?;

    let poly_file = config.poly_file();
    let additional = if poly_file.is_file() {
        format!("\n        <additional-files value=\"{}\"/>", poly_file.display())
    } else {
        String::new()
    };
    let contents = format!(r###"<configuration>
    <input>
        <net-file value="{net}"/>
        <route-files value="{routes}"/>{additional}
    </input>
    <time>
        <begin value="0"/>
        <end value="{end}"/>
    </time>
    <output>
        <summary-output value="{summary}"/>
        <tripinfo-output value="{tripinfo}"/>
    </output>
</configuration>
"###,
        net = config.net_file().display(),
        routes = config.route_file().display(),
        additional = additional,
        end = config.end_time,
        summary = run_dir.join(SUMMARY_FILE).display(),
        tripinfo = run_dir.join(TRIPINFO_FILE).display(),
    );

    let cfg_path = config.work_dir.join(format!("{}_{}.sumocfg", config.name, label));
    fs::write(&cfg_path, contents)?;
    log::info!("Wrote {} run configuration to {}", label, cfg_path.display());
    Ok(cfg_path)
}

/// The unrestricted reference run, without a control channel.
pub fn run_baseline(config: &ScenarioConfig) -> SimResult<()> {
    let cfg_path = write_sumocfg(config, UNBLOCKED_LABEL)?;
    let binary = resolve_binary(&config.sumo_binary)?;
    let args: Vec<String> = vec![
        "-c".to_string(), path_arg(&cfg_path),
        "--step-length".to_string(), "1".to_string(),
        "--quit-on-end".to_string(), "--no-warnings".to_string(), "--no-step-log".to_string(),
    ];
    run_command(&path_arg(&binary), &args, "baseline simulation")?;
    log::info!("Baseline results in {}", config.run_dir(UNBLOCKED_LABEL).display());
    Ok(())
}

/// Resolves the configured targets against the network and builds a ready-to-run controller.
pub fn build_controller(config: &ScenarioConfig, index: &NetworkIndex)
                        -> SimResult<RestrictionController> {
    let restriction = &config.restriction;
    let tokens = match &restriction.targets {
        TargetSource::Lanes(tokens) => tokens.clone(),
        TargetSource::Suggest(nn) => targets::suggest_targets(index, *nn),
    };
    let parsed = targets::parse_targets(&tokens, index);
    log::info!("{} of {} lane token(s) accepted", parsed.targets.len(), tokens.len());

    let window = RestrictionWindow::new(restriction.start_time, restriction.duration)?;
    let plan = RestrictionPlan::new(restriction.mode, window, parsed.targets, index,
                                    restriction.agents.clone());
    let controller = RestrictionController::new(plan, VehicleClasses::default())?;
    Ok(controller.with_progress_interval(config.traci.progress_interval))
}

pub fn load_network_index(config: &ScenarioConfig) -> SimResult<NetworkIndex> {
    let index = NetworkIndex::from_xml_files(&config.net_file(), &config.route_file())?;
    let major = index.major_segments();
    log::info!("Network has {} segments ({} major), {} planned trips",
               index.len(), major.len(), index.trip_count());
    if !major.is_empty() {
        log::debug!("Major segments: {}", major.iter().map(|seg| &seg.id).join(", "));
    }
    Ok(index)
}

/// The restricted run over any control channel. The action log is written next to the run's
/// trip log.
pub fn run_restricted_with<C, F>(config: &ScenarioConfig, index: &NetworkIndex, connect: F)
                                 -> SimResult<RunSummary>
    where C: ControlChannel, F: FnOnce() -> SimResult<C>
{
    let mut controller = build_controller(config, index)?;
    fs::create_dir_all(config.run_dir(BLOCKED_LABEL))?;
    let summary = controller.run(connect, config.end_time)?;

    let actions_path = config.run_dir(BLOCKED_LABEL).join(ACTIONS_FILE);
    write_actions_csv(&summary.actions, &actions_path)?;
    let failed = summary.actions.iter().filter(|action| !action.succeeded).count();
    log::info!("Restricted run finished after {} steps; {} action(s), {} failed, logged to {}",
               summary.steps, summary.actions.len(), failed, actions_path.display());
    Ok(summary)
}

pub fn run_restricted(config: &ScenarioConfig, index: &NetworkIndex) -> SimResult<RunSummary> {
    let cfg_path = write_sumocfg(config, BLOCKED_LABEL)?;
    let mut launcher = SumoLauncher::new(&config.sumo_binary, &cfg_path);
    launcher.port = config.traci.port;
    launcher.attach_retries = config.traci.attach_retries;
    run_restricted_with(config, index, || launcher.launch())
}

/// Compares the two runs' trip logs, writing the comparison table. None if either log has no
/// valid trips.
pub fn compare_runs(config: &ScenarioConfig) -> SimResult<Option<ComparisonReport>> {
    let unblocked = metrics::extract_metrics(&config.tripinfo_file(UNBLOCKED_LABEL))?;
    let blocked = metrics::extract_metrics(&config.tripinfo_file(BLOCKED_LABEL))?;
    let (unblocked, blocked) = match (unblocked, blocked) {
        (Some(unblocked), Some(blocked)) => (unblocked, blocked),
        _ => {
            log::warn!("Cannot compare runs: a trip log has no valid trips");
            return Ok(None);
        }
    };

    let report = metrics::compare(&unblocked, &blocked);
    let csv_path = config.scenario_log_dir().join(COMPARISON_FILE);
    report.write_csv(&csv_path)?;
    log::info!("Comparison written to {}", csv_path.display());
    Ok(Some(report))
}

/// The full pipeline: optional input generation, baseline run, restricted run, comparison.
pub fn run_scenario(config: &ScenarioConfig) -> SimResult<Option<ComparisonReport>> {
    if let Some(generate) = &config.generate {
        generate_inputs(config, generate)?;
    }
    // fail on bad targets before spending time on the baseline
    let index = load_network_index(config)?;
    build_controller(config, &index)?;

    run_baseline(config)?;
    run_restricted(config, &index)?;
    compare_runs(config)
}

// A minimal client for SUMO's TraCI protocol: just the calls the restriction controller needs.
use std::env;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use super::error::{SimError, SimResult};


// command ids
const CMD_GETVERSION: u8 = 0x00;
const CMD_SIMSTEP: u8 = 0x02;
const CMD_CLOSE: u8 = 0x7F;
const CMD_GET_LANE_VARIABLE: u8 = 0xa3;
const CMD_GET_VEHICLE_VARIABLE: u8 = 0xa4;
const CMD_GET_SIM_VARIABLE: u8 = 0xab;
const CMD_SET_LANE_VARIABLE: u8 = 0xc3;
const CMD_SET_VEHICLE_VARIABLE: u8 = 0xc4;

// variable ids
const TRACI_ID_LIST: u8 = 0x00;
const LANE_ALLOWED: u8 = 0x34;
const VAR_SPEED: u8 = 0x40;
const VAR_ROAD_ID: u8 = 0x50;
const VAR_LANE_INDEX: u8 = 0x52;
const VAR_MIN_EXPECTED_VEHICLES: u8 = 0x7d;

// value type ids
const TYPE_INTEGER: u8 = 0x09;
const TYPE_DOUBLE: u8 = 0x0b;
const TYPE_STRING: u8 = 0x0c;
const TYPE_STRINGLIST: u8 = 0x0e;

const RTYPE_OK: u8 = 0x00;


/// The step-synchronous calls the controller makes on a running simulation. Any number of
/// queries and commands may be issued between two calls to `simulation_step`.
pub trait ControlChannel {
    fn simulation_step(&mut self) -> SimResult<()>;
    /// Vehicles still running or waiting to depart.
    fn min_expected_agents(&mut self) -> SimResult<i32>;
    /// Vehicle classes currently permitted on a lane.
    fn lane_allowed(&mut self, lane_id: &str) -> SimResult<Vec<String>>;
    fn set_lane_allowed(&mut self, lane_id: &str, classes: &[String]) -> SimResult<()>;
    /// Ids of the vehicles currently in the network.
    fn agent_ids(&mut self) -> SimResult<Vec<String>>;
    fn agent_road_id(&mut self, agent_id: &str) -> SimResult<String>;
    fn agent_lane_index(&mut self, agent_id: &str) -> SimResult<i32>;
    /// A negative speed hands control back to the simulator's car-following model.
    fn set_agent_speed(&mut self, agent_id: &str, speed: f64) -> SimResult<()>;
    fn close(&mut self) -> SimResult<()>;
}


/// Outgoing bytes in TraCI's big-endian encoding.
#[derive(Default)]
struct Storage {
    bytes: Vec<u8>,
}

impl Storage {
    fn push_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn push_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn push_f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn push_string(&mut self, value: &str) {
        self.push_i32(value.len() as i32);
        self.bytes.extend_from_slice(value.as_bytes());
    }

    fn push_string_list(&mut self, values: &[String]) {
        self.push_i32(values.len() as i32);
        for value in values {
            self.push_string(value);
        }
    }
}

/// Frames a single command: a one-byte length, or a zero byte and a four-byte length for
/// commands longer than 255 bytes.
fn encode_command(command: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    let short_len = 1 + 1 + content.len();
    if short_len <= 255 {
        out.push(short_len as u8);
    } else {
        out.push(0);
        out.extend_from_slice(&((short_len + 4) as i32).to_be_bytes());
    }
    out.push(command);
    out.extend_from_slice(content);
    out
}

fn encode_message(commands: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(commands.len() + 4);
    out.extend_from_slice(&((commands.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(commands);
    out
}

/// Incoming bytes of one response message.
struct Reader {
    bytes: Vec<u8>,
    pos: usize,
}

impl Reader {
    fn new(bytes: Vec<u8>) -> Reader {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, count: usize) -> SimResult<&[u8]> {
        if self.pos + count > self.bytes.len() {
            return Err(SimError::Transport(format!(
                "response truncated: wanted {} bytes at offset {} of {}",
                count, self.pos, self.bytes.len())));
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn read_u8(&mut self) -> SimResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> SimResult<i32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(i32::from_be_bytes(buf))
    }

    fn read_string(&mut self) -> SimResult<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(SimError::Transport(format!("negative string length {}", len)));
        }
        let raw = self.take(len as usize)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn read_string_list(&mut self) -> SimResult<Vec<String>> {
        let count = self.read_i32()?;
        (0..count.max(0)).map(|_| self.read_string()).collect()
    }

    /// Reads a command header, returning the command id.
    fn read_command_header(&mut self) -> SimResult<u8> {
        let len = self.read_u8()?;
        if len == 0 {
            self.read_i32()?;
        }
        self.read_u8()
    }

    fn expect_type(&mut self, expected: u8) -> SimResult<()> {
        let found = self.read_u8()?;
        if found != expected {
            return Err(SimError::Transport(format!(
                "expected value type 0x{:02x}, got 0x{:02x}", expected, found)));
        }
        Ok(())
    }
}


pub struct TraciClient {
    stream: TcpStream,
    sumo: Option<Child>,
    closed: bool,
}

impl TraciClient {
    /// Attaches to a simulator already listening on host:port.
    pub fn connect(host: &str, port: u16, retries: u32) -> SimResult<TraciClient> {
        let stream = connect_with_retries(host, port, retries, None)?;
        let mut client = TraciClient { stream, sumo: None, closed: false };
        client.log_version()?;
        Ok(client)
    }

    fn log_version(&mut self) -> SimResult<()> {
        let mut reader = self.send_command(CMD_GETVERSION, &[])?;
        let response = reader.read_command_header()?;
        if response != CMD_GETVERSION {
            return Err(SimError::Transport(format!(
                "unexpected response 0x{:02x} to version request", response)));
        }
        let api_version = reader.read_i32()?;
        let description = reader.read_string()?;
        log::info!("Attached to {} (TraCI api {})", description, api_version);
        Ok(())
    }

    fn send_command(&mut self, command: u8, content: &[u8]) -> SimResult<Reader> {
        let message = encode_message(&encode_command(command, content));
        log::trace!("-> command 0x{:02x}, {} bytes", command, message.len());
        self.stream.write_all(&message).map_err(transport_error)?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).map_err(transport_error)?;
        let total_len = i32::from_be_bytes(len_buf);
        if total_len < 4 {
            return Err(SimError::Transport(format!("bad message length {}", total_len)));
        }
        let mut body = vec![0u8; total_len as usize - 4];
        self.stream.read_exact(&mut body).map_err(transport_error)?;

        let mut reader = Reader::new(body);
        check_status(&mut reader, command)?;
        Ok(reader)
    }

    fn get_variable(&mut self, command: u8, variable: u8, object_id: &str)
                    -> SimResult<Reader> {
        let mut content = Storage::default();
        content.push_u8(variable);
        content.push_string(object_id);
        let mut reader = self.send_command(command, &content.bytes)?;

        let response = reader.read_command_header()?;
        if response != command + 0x10 {
            return Err(SimError::Transport(format!(
                "unexpected response 0x{:02x} to command 0x{:02x}", response, command)));
        }
        let response_var = reader.read_u8()?;
        let response_id = reader.read_string()?;
        if response_var != variable || response_id != object_id {
            return Err(SimError::Transport(format!(
                "response for 0x{:02x} '{}' does not match request", response_var, response_id)));
        }
        Ok(reader)
    }

    fn set_variable(&mut self, command: u8, variable: u8, object_id: &str, value: Storage)
                    -> SimResult<()> {
        let mut content = Storage::default();
        content.push_u8(variable);
        content.push_string(object_id);
        content.bytes.extend_from_slice(&value.bytes);
        self.send_command(command, &content.bytes)?;
        Ok(())
    }
}

fn transport_error(err: io::Error) -> SimError {
    SimError::Transport(err.to_string())
}

fn check_status(reader: &mut Reader, command: u8) -> SimResult<()> {
    let status_cmd = reader.read_command_header()?;
    let result = reader.read_u8()?;
    let description = reader.read_string()?;
    if status_cmd != command {
        return Err(SimError::Transport(format!(
            "status for command 0x{:02x} received while waiting for 0x{:02x}",
            status_cmd, command)));
    }
    if result != RTYPE_OK {
        return Err(SimError::Command { command, message: description });
    }
    Ok(())
}

impl ControlChannel for TraciClient {
    fn simulation_step(&mut self) -> SimResult<()> {
        let mut content = Storage::default();
        // target time 0 means "one step"
        content.push_f64(0.0);
        // subscription results follow the status, but we never subscribe
        self.send_command(CMD_SIMSTEP, &content.bytes)?;
        Ok(())
    }

    fn min_expected_agents(&mut self) -> SimResult<i32> {
        let mut reader = self.get_variable(CMD_GET_SIM_VARIABLE, VAR_MIN_EXPECTED_VEHICLES, "")?;
        reader.expect_type(TYPE_INTEGER)?;
        reader.read_i32()
    }

    fn lane_allowed(&mut self, lane_id: &str) -> SimResult<Vec<String>> {
        let mut reader = self.get_variable(CMD_GET_LANE_VARIABLE, LANE_ALLOWED, lane_id)?;
        reader.expect_type(TYPE_STRINGLIST)?;
        reader.read_string_list()
    }

    fn set_lane_allowed(&mut self, lane_id: &str, classes: &[String]) -> SimResult<()> {
        let mut value = Storage::default();
        value.push_u8(TYPE_STRINGLIST);
        value.push_string_list(classes);
        self.set_variable(CMD_SET_LANE_VARIABLE, LANE_ALLOWED, lane_id, value)
    }

    fn agent_ids(&mut self) -> SimResult<Vec<String>> {
        let mut reader = self.get_variable(CMD_GET_VEHICLE_VARIABLE, TRACI_ID_LIST, "")?;
        reader.expect_type(TYPE_STRINGLIST)?;
        reader.read_string_list()
    }

    fn agent_road_id(&mut self, agent_id: &str) -> SimResult<String> {
        let mut reader = self.get_variable(CMD_GET_VEHICLE_VARIABLE, VAR_ROAD_ID, agent_id)?;
        reader.expect_type(TYPE_STRING)?;
        reader.read_string()
    }

    fn agent_lane_index(&mut self, agent_id: &str) -> SimResult<i32> {
        let mut reader = self.get_variable(CMD_GET_VEHICLE_VARIABLE, VAR_LANE_INDEX, agent_id)?;
        reader.expect_type(TYPE_INTEGER)?;
        reader.read_i32()
    }

    fn set_agent_speed(&mut self, agent_id: &str, speed: f64) -> SimResult<()> {
        let mut value = Storage::default();
        value.push_u8(TYPE_DOUBLE);
        value.push_f64(speed);
        self.set_variable(CMD_SET_VEHICLE_VARIABLE, VAR_SPEED, agent_id, value)
    }

    fn close(&mut self) -> SimResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.send_command(CMD_CLOSE, &[]).map(|_| ());
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(mut child) = self.sumo.take() {
            match child.wait() {
                Ok(status) if !status.success() => {
                    log::warn!("Simulator exited with {}", status);
                }
                Err(err) => log::warn!("Could not wait for simulator: {}", err),
                _ => {}
            }
        }
        result
    }
}

impl Drop for TraciClient {
    fn drop(&mut self) {
        // a child we still own here was never closed cleanly
        if let Some(mut child) = self.sumo.take() {
            let _ = self.stream.shutdown(Shutdown::Both);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}


fn connect_with_retries(host: &str, port: u16, retries: u32, child: Option<&mut Child>)
                        -> SimResult<TcpStream> {
    let mut child = child;
    let mut last_err = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            thread::sleep(Duration::from_secs(1));
        }
        // give up early if the simulator died before opening its port
        if let Some(child) = child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SimError::Attach(format!(
                    "simulator exited with {} before accepting a connection", status)));
            }
        }
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                stream.set_nodelay(true).map_err(transport_error)?;
                return Ok(stream);
            }
            Err(err) => {
                log::debug!("Attach attempt {} to {}:{} failed: {}", attempt + 1, host, port, err);
                last_err = Some(err);
            }
        }
    }
    Err(SimError::Attach(format!("{}:{} after {} attempts: {}", host, port, retries + 1,
        last_err.map(|err| err.to_string()).unwrap_or_default())))
}

/// Starts a simulator process listening for TraCI and attaches to it.
pub struct SumoLauncher {
    pub binary: String,
    pub config_file: PathBuf,
    pub port: Option<u16>,
    pub attach_retries: u32,
}

impl SumoLauncher {
    pub fn new(binary: &str, config_file: &Path) -> SumoLauncher {
        SumoLauncher {
            binary: String::from(binary),
            config_file: config_file.to_path_buf(),
            port: None,
            attach_retries: 60,
        }
    }

    pub fn launch(&self) -> SimResult<TraciClient> {
        let binary = resolve_binary(&self.binary)?;
        let port = match self.port {
            Some(port) => port,
            None => free_port()?,
        };

        let mut command = Command::new(&binary);
        command.arg("-c").arg(&self.config_file)
               .arg("--remote-port").arg(port.to_string())
               .args(&["--step-length", "1", "--no-warnings", "--quit-on-end"])
               .stdout(Stdio::null())
               .stderr(Stdio::null());
        log::info!("Launching {} on port {}", binary.display(), port);
        let mut child = command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => SimError::ExecutableNotFound { binary: self.binary.clone() },
            _ => SimError::Io(err),
        })?;

        let stream = match connect_with_retries("localhost", port, self.attach_retries,
                                                Some(&mut child)) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        let mut client = TraciClient { stream, sumo: Some(child), closed: false };
        client.log_version()?;
        Ok(client)
    }
}

/// Finds the simulator executable: as given if it is a path, then on PATH, then in
/// $SUMO_HOME/bin.
pub fn resolve_binary(binary: &str) -> SimResult<PathBuf> {
    let given = Path::new(binary);
    if given.components().count() > 1 {
        if given.is_file() {
            return Ok(given.to_path_buf());
        }
        return Err(SimError::ExecutableNotFound { binary: String::from(binary) });
    }

    let mut search_dirs: Vec<PathBuf> = match env::var_os("PATH") {
        Some(paths) => env::split_paths(&paths).collect(),
        None => vec![],
    };
    if let Some(sumo_home) = env::var_os("SUMO_HOME") {
        search_dirs.push(Path::new(&sumo_home).join("bin"));
    }
    for dir in search_dirs {
        for candidate in &[dir.join(binary), dir.join(format!("{}.exe", binary))] {
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }
    }
    Err(SimError::ExecutableNotFound { binary: String::from(binary) })
}

fn free_port() -> SimResult<u16> {
    let listener = TcpListener::bind(("localhost", 0))?;
    Ok(listener.local_addr()?.port())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_framing() {
        let short = encode_command(CMD_SIMSTEP, &0.0f64.to_be_bytes());
        assert_eq!(short.len(), 10);
        assert_eq!(short[0], 10);
        assert_eq!(short[1], CMD_SIMSTEP);

        let long_content = vec![7u8; 300];
        let long = encode_command(CMD_SET_LANE_VARIABLE, &long_content);
        assert_eq!(long[0], 0);
        assert_eq!(i32::from_be_bytes([long[1], long[2], long[3], long[4]]), 306);
        assert_eq!(long[5], CMD_SET_LANE_VARIABLE);
        assert_eq!(long.len(), 306);

        let message = encode_message(&short);
        assert_eq!(i32::from_be_bytes([message[0], message[1], message[2], message[3]]), 14);
    }

    #[test]
    fn test_string_list_encoding() {
        let mut storage = Storage::default();
        storage.push_string_list(&["bus".to_string(), "taxi".to_string()]);
        let mut reader = Reader::new(storage.bytes);
        assert_eq!(reader.read_string_list().unwrap(), vec!["bus", "taxi"]);
        assert!(reader.read_u8().is_err());
    }

    fn status_bytes(command: u8, result: u8, description: &str) -> Vec<u8> {
        let mut content = Storage::default();
        content.push_u8(result);
        content.push_string(description);
        encode_command(command, &content.bytes)
    }

    #[test]
    fn test_status_checking() {
        let mut reader = Reader::new(status_bytes(CMD_SET_LANE_VARIABLE, RTYPE_OK, ""));
        assert!(check_status(&mut reader, CMD_SET_LANE_VARIABLE).is_ok());

        let mut reader = Reader::new(status_bytes(CMD_SET_LANE_VARIABLE, 0xff, "Lane 'x_0' is not known"));
        match check_status(&mut reader, CMD_SET_LANE_VARIABLE) {
            Err(SimError::Command { command, message }) => {
                assert_eq!(command, CMD_SET_LANE_VARIABLE);
                assert_eq!(message, "Lane 'x_0' is not known");
            }
            other => panic!("unexpected result {:?}", other),
        }

        let mut reader = Reader::new(vec![5, CMD_SIMSTEP]);
        match check_status(&mut reader, CMD_SIMSTEP) {
            Err(SimError::Transport(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    /// Plays a scripted simulator on a local socket: answers each request with the next reply.
    fn fake_simulator(replies: Vec<Vec<u8>>) -> (u16, thread::JoinHandle<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut requests = vec![];
            for reply in replies {
                let mut len_buf = [0u8; 4];
                stream.read_exact(&mut len_buf).unwrap();
                let mut body = vec![0u8; i32::from_be_bytes(len_buf) as usize - 4];
                stream.read_exact(&mut body).unwrap();
                requests.push(body);
                stream.write_all(&encode_message(&reply)).unwrap();
            }
            requests
        });
        (port, handle)
    }

    #[test]
    fn test_client_roundtrip() {
        let mut version = status_bytes(CMD_GETVERSION, RTYPE_OK, "");
        let mut version_body = Storage::default();
        version_body.push_i32(21);
        version_body.push_string("SUMO 1.19.0");
        version.extend(encode_command(CMD_GETVERSION, &version_body.bytes));

        let mut expected = status_bytes(CMD_GET_SIM_VARIABLE, RTYPE_OK, "");
        let mut expected_body = Storage::default();
        expected_body.push_u8(VAR_MIN_EXPECTED_VEHICLES);
        expected_body.push_string("");
        expected_body.push_u8(TYPE_INTEGER);
        expected_body.push_i32(42);
        expected.extend(encode_command(CMD_GET_SIM_VARIABLE + 0x10, &expected_body.bytes));

        let mut step = status_bytes(CMD_SIMSTEP, RTYPE_OK, "");
        step.extend_from_slice(&0i32.to_be_bytes());

        let mut allowed = status_bytes(CMD_GET_LANE_VARIABLE, RTYPE_OK, "");
        let mut allowed_body = Storage::default();
        allowed_body.push_u8(LANE_ALLOWED);
        allowed_body.push_string("A1_0");
        allowed_body.push_u8(TYPE_STRINGLIST);
        allowed_body.push_string_list(&["passenger".to_string(), "bus".to_string()]);
        allowed.extend(encode_command(CMD_GET_LANE_VARIABLE + 0x10, &allowed_body.bytes));

        let lane = status_bytes(CMD_SET_LANE_VARIABLE, RTYPE_OK, "");
        let close = status_bytes(CMD_CLOSE, RTYPE_OK, "");

        let (port, handle) = fake_simulator(vec![version, expected, step, allowed, lane, close]);
        let mut client = TraciClient::connect("127.0.0.1", port, 5).unwrap();
        assert_eq!(client.min_expected_agents().unwrap(), 42);
        client.simulation_step().unwrap();
        assert_eq!(client.lane_allowed("A1_0").unwrap(), vec!["passenger", "bus"]);
        client.set_lane_allowed("A1_0", &["emergency".to_string()]).unwrap();
        client.close().unwrap();
        // closing twice is a no-op
        client.close().unwrap();

        let requests = handle.join().unwrap();
        assert_eq!(requests.len(), 6);
        assert_eq!(requests[2][1], CMD_SIMSTEP);
        assert_eq!(requests[3][1], CMD_GET_LANE_VARIABLE);
        assert_eq!(requests[3][2], LANE_ALLOWED);
        let lane_request = &requests[4];
        assert_eq!(lane_request[1], CMD_SET_LANE_VARIABLE);
        assert_eq!(lane_request[2], LANE_ALLOWED);
        let mut reader = Reader::new(lane_request[3..].to_vec());
        assert_eq!(reader.read_string().unwrap(), "A1_0");
        reader.expect_type(TYPE_STRINGLIST).unwrap();
        assert_eq!(reader.read_string_list().unwrap(), vec!["emergency"]);
        assert_eq!(requests[5][1], CMD_CLOSE);
    }

    #[test]
    fn test_missing_binary() {
        match resolve_binary("definitely-not-a-simulator-binary") {
            Err(SimError::ExecutableNotFound { binary }) => {
                assert_eq!(binary, "definitely-not-a-simulator-binary");
            }
            other => panic!("unexpected result {:?}", other),
        }
        let launcher = SumoLauncher::new("/no/such/dir/sumo", Path::new("x.sumocfg"));
        assert!(match launcher.launch() {
            Err(SimError::ExecutableNotFound { .. }) => true,
            _ => false,
        });
    }
}

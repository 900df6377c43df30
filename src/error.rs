use std::error::Error;
use std::fmt;
use std::io;


/// Every failure the scenario runner can report.
#[derive(Debug)]
pub enum SimError {
    // bad or missing configuration, detected before any simulator is touched
    Config(String),
    // malformed network, route or trip-log input
    Parse { context: String, message: String },
    Io(io::Error),
    Csv(csv::Error),
    ExecutableNotFound { binary: String },
    Attach(String),
    // the control channel itself broke (short reads, closed socket, bad framing)
    Transport(String),
    // the simulator answered a command with an error status
    Command { command: u8, message: String },
    // an external conversion/routing tool exited unsuccessfully
    Tool { tool: String, stderr: String },
}

impl SimError {
    pub fn config<S: Into<String>>(message: S) -> SimError {
        SimError::Config(message.into())
    }

    pub fn parse<C: Into<String>, M: ToString>(context: C, message: M) -> SimError {
        SimError::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Config(msg) => write!(f, "configuration error: {}", msg),
            SimError::Parse { context, message } => {
                write!(f, "could not parse {}: {}", context, message)
            }
            SimError::Io(err) => write!(f, "i/o error: {}", err),
            SimError::Csv(err) => write!(f, "csv error: {}", err),
            SimError::ExecutableNotFound { binary } => write!(
                f,
                "simulator executable '{}' not found; is it on PATH or is SUMO_HOME set?",
                binary
            ),
            SimError::Attach(msg) => write!(f, "could not attach to simulator: {}", msg),
            SimError::Transport(msg) => write!(f, "control channel failure: {}", msg),
            SimError::Command { command, message } => {
                write!(f, "simulator rejected command 0x{:02x}: {}", command, message)
            }
            SimError::Tool { tool, stderr } => write!(f, "{} failed: {}", tool, stderr.trim()),
        }
    }
}

impl Error for SimError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SimError::Io(err) => Some(err),
            SimError::Csv(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SimError {
    fn from(err: io::Error) -> SimError {
        SimError::Io(err)
    }
}

impl From<xml::reader::Error> for SimError {
    fn from(err: xml::reader::Error) -> SimError {
        SimError::parse("xml document", err)
    }
}

impl From<csv::Error> for SimError {
    fn from(err: csv::Error) -> SimError {
        SimError::Csv(err)
    }
}

pub type SimResult<T> = Result<T, SimError>;

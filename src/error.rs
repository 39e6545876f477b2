use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FleetError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no daemon answering on {addr}")]
    #[diagnostic(help("start it with `sudo flotilla server start`"))]
    Unreachable { addr: String },

    #[error("daemon on {addr} did not answer '{operation}' in time")]
    Unresponsive { addr: String, operation: String },

    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("not enough privileges to start the daemon")]
    #[diagnostic(help("run it with sudo"))]
    InsufficientPrivilege,

    #[error("unable to grab the address of VM '{name}' after {secs}s, aborted")]
    BootTimeout { name: String, secs: u64 },

    #[error("VM '{name}' terminated abnormally before reporting an address")]
    TerminatedEarly { name: String },

    #[error("failed to spawn runner for VM '{name}': {message}")]
    SpawnFailed { name: String, message: String },

    #[error("unable to find a usable UUID after {attempts} attempts")]
    IdentityExhausted { attempts: usize },

    #[error(
        "aggregated VM memory would reach {requested_mb}MB, above the {ceiling_mb}MB ceiling"
    )]
    ResourceBound { requested_mb: u64, ceiling_mb: u64 },

    #[error("image {channel}/{version} is not available locally")]
    ImageNotFound { channel: String, version: String },

    #[error("daemon error: {message}")]
    Daemon { message: String },

    #[error("failed to encode output: {message}")]
    Encode { message: String },
}

impl FleetError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FleetError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Flattens an error for transport; roam methods carry errors as strings.
pub(crate) fn wire(err: FleetError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

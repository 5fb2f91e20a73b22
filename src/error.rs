//! Crate-wide error taxonomy and the mapping onto POSIX `EX_*` exit codes.
//!
//! Grounded on `vcontrol/error.rs`'s `thiserror`-enum-behind-an-`anyhow`-alias
//! shape, generalized to the handful of startup-fatal categories this
//! manager needs (`spec.md` §7, §6).

use std::process::ExitCode;

/// Startup-fatal errors. Each variant maps to exactly one `sysexits.h` code;
/// everything else (protocol, identity, command, privilege-drop) is handled
/// inline by the dispatch loop and never reaches `main`.
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("registration rejected by control plane: {0}")]
    RegistrationUnavailable(String),

    #[error("malformed registration payload: {0}")]
    RegistrationDataError(String),

    #[error("network failure while registering endpoint: {0}")]
    RegistrationTempFail(#[from] reqwest::Error),

    #[error(
        "server/client disagreement: expected endpoint id {expected}, received {received}"
    )]
    EndpointIdMismatch { expected: String, received: String },

    #[error("identity mapping config required for a privileged process, but none configured")]
    IdentityMappingMissing,

    #[error("cannot read identity mapping configuration: {0}")]
    IdentityMappingPermission(#[source] std::io::Error),

    #[error("failed to parse identity mapping configuration: {0}")]
    IdentityMappingConfig(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// `sysexits.h` codes named explicitly in `spec.md` §6.
    pub fn exit_code(&self) -> ExitCode {
        let code: u8 = match self {
            ManagerError::RegistrationUnavailable(_) => 69, // EX_UNAVAILABLE
            ManagerError::RegistrationDataError(_) => 65,   // EX_DATAERR
            ManagerError::RegistrationTempFail(_) => 75,    // EX_TEMPFAIL
            ManagerError::EndpointIdMismatch { .. } => 70,  // EX_SOFTWARE
            ManagerError::IdentityMappingMissing => 72,     // EX_OSFILE
            ManagerError::IdentityMappingPermission(_) => 77, // EX_NOPERM
            ManagerError::IdentityMappingConfig(_) => 78,   // EX_CONFIG
            ManagerError::Config(_) => 78,
            ManagerError::Io(_) => 70,
        };
        ExitCode::from(code)
    }
}

/// Transport-layer errors: connection, publish, and ack failures for C2/C3.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection to control plane lost: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("ack failed for delivery tag {0}: {1}")]
    Ack(u64, String),

    #[error("timed out waiting for worker thread to join")]
    JoinTimeout,
}

/// Errors from the identity mapper (C1).
#[derive(thiserror::Error, Debug)]
pub enum IdentityMapperError {
    #[error("permission denied reading policy file: {0}")]
    Permission(#[source] std::io::Error),

    #[error("failed to parse policy file: {0}")]
    Config(String),

    #[error("no policy rule matched the given identity set")]
    NoMatch,
}

/// Errors raised synchronously by the child-launch pipeline (C6).
///
/// Each variant corresponds to one step of `spec.md` §4.6; the breadcrumb
/// `exit_code` carried alongside it (not part of this type — see
/// `launch::ExitCode`) is what actually reaches the parent across `_exit`.
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("missing endpoint name")]
    MissingName,

    #[error("refusing to start endpoint under the manager's own identity (uid {uid}, user {uname})")]
    SameUser { uid: u32, uname: String },

    #[error("stdin payload too large: {size} bytes exceeds pipe capacity {capacity}")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("user config template rendering failed: {0}")]
    TemplateRender(String),

    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Command-dispatch-level errors (`spec.md` §4.5 step 7-8). These never
/// escape the event loop; they are converted into a failure-notice fork.
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("unknown or invalid command: {0:?}")]
    InvalidCommand(Option<String>),

    #[error(transparent)]
    InvalidUser(#[from] LaunchError),
}

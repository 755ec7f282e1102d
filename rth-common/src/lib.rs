//! Shared vocabulary for the runtime test harness.
//!
//! Everything both sides of the worker wire protocol must agree on lives
//! here: action payloads, the framed codec, status semantics (exit codes and
//! embedded status lines), and the logging bootstrap used by the controller
//! library and the worker binary.

pub mod action;
pub mod log;
pub mod protocol;
pub mod status;

pub use action::{CompileAction, MainAction};
pub use log::{LOG_ENV_VAR, LogConfig, LogError, init_logging};
pub use protocol::{
    FrameReader, FrameWriter, MAX_FIELD, MESSAGE_STREAM, ProtocolError, Reply, Request,
    STDERR_STREAM, STDOUT_STREAM,
};
pub use status::{
    EXIT_CODE_BASE, ExitMap, STATUS_LINE_PREFIX, Status, StatusKind, StatusLineScanner,
    interpret_exit, parse_status_line,
};

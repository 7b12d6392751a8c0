//! Long-running sync loop for one station: periodic single-flight cycles,
//! ctrl-c and socket-driven shutdown, and a Unix-socket control protocol.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_status, request_stop, request_sync, send_request, DaemonCommand, DaemonRequest,
    DaemonResponse, DaemonStatus, StopAck,
};
pub use runtime::{run, run_with_driver, start_blocking};

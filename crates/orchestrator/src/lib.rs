pub mod capture;
pub mod completion;
pub mod context;
pub mod decode;
pub mod error;
pub mod file_relay;
pub mod process;
pub mod pty_relay;
pub mod side_log;
pub mod source;
pub mod state_machine;

pub use capture::{CaptureOptions, CaptureRun};
pub use completion::CompletionWatcher;
pub use context::{ExitLatch, RunContext, RunOutcome, RunSettings};
pub use error::{RelayError, Result};
pub use file_relay::{FileRelay, FileRelayOptions};
pub use process::ProcessHandle;
pub use pty_relay::{PtyRelay, PtyRelayOptions};
pub use side_log::SideLogEcho;
pub use source::{FileTailSource, Framing, OutputSource, PtySource};
pub use state_machine::{RunState, RunStateMachine};

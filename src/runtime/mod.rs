pub mod logging;
pub mod loops;
pub mod recovery;
pub mod registry;
pub mod state_paths;
pub mod supervisor;

pub use crate::shared::errors::RuntimeError;
pub use logging::append_runtime_log;
pub use recovery::{dedupe_batch_members, recover_dispatched_batches};
pub use registry::{apply_loop_event, LoopEvent, LoopHealth, LoopState};
pub use state_paths::{bootstrap_state_root, StatePaths};
pub use supervisor::{
    clear_start_lock, load_supervisor_state, reserve_start_lock, run_supervisor,
    save_supervisor_state, signal_stop, SupervisorState,
};

//! AutoCoder core orchestration engine: backlog lifecycle (`store`), worktree
//! isolation (`worktree`), port allocation (`ports`), merge verification
//! (`gatekeeper`), worker process supervision (`supervisor`), and the tick
//! loop tying them together (`orchestrator`).

pub mod cli;
pub mod config;
pub mod gatekeeper;
pub mod git;
pub mod locks;
pub mod logs;
pub mod orchestrator;
pub mod ports;
pub mod runtime;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod worktree;

pub use config::AutocoderConfig;
pub use gatekeeper::{Gatekeeper, VerifyAndMergeOptions, VerifyAndMergeResult};
pub use git::GitRepo;
pub use orchestrator::{Orchestrator, TickSummary};
pub use ports::{PortAllocator, PortPair};
pub use runtime::Runtime;
pub use store::Store;
pub use supervisor::{SpawnSpec, WorkerSupervisor};
pub use worktree::WorktreeManager;

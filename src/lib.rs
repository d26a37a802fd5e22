#[cfg(not(target_os = "linux"))]
compile_error!("container-backend only works on linux");

pub mod errors;
pub mod fanout;
pub mod idmap;
pub mod iodaemon;
pub mod logging;
pub mod namespace;
pub mod process;
pub mod process_tracker;
pub mod registry;
pub mod rootfs;
pub mod runtime;
pub mod sync;

// Re-export main types and functions for easier testing
pub use errors::{BrokerError, IdMapError, LinkError, RegistryError, SyncError};
pub use fanout::FanoutWriter;
pub use idmap::{Mapping, MappingList};
pub use iodaemon::{Broker, Link};
pub use namespace::UserNamespace;
pub use process::ProcessSpec;
pub use process_tracker::ProcessTracker;
pub use registry::{Container, ContainerPool, ContainerRegistry, ContainerSpec};
pub use runtime::{RunConfig, run_container};
pub use sync::{Handshake, PipeSynchronizer, pipe_pair};

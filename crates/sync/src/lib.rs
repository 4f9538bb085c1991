//! View Syncer: per-client-group orchestration of the CVR updaters and
//! Pipeline Driver into the poke protocol clients speak.

pub mod config;
pub mod drain;
pub mod lock;
pub mod metrics;
pub mod poke;
pub mod service;

pub use drain::DrainCoordinator;
pub use lock::{
    AsyncLock,
    EvictionTimer,
};
pub use poke::{
    check_safe_integers,
    ClientPoker,
    ClientSink,
    PokeHandler,
};
pub use service::ViewSyncerService;

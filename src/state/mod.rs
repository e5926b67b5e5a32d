pub mod etcd;
pub mod file;
pub mod manager;
pub mod mirror;
pub mod store;
pub mod types;

pub use manager::StateManager;
pub use mirror::StateMirror;
pub use store::{LockLease, StateStore};
pub use types::*;

//! walletd: keeps a fleet of `monero-wallet-rpc` processes alive, reports their
//! health, and serializes wallet mutations through node and wallet locks.

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod lock;
pub mod node;
pub mod process;
pub mod registry;
pub mod status;
pub mod supervisor;

pub use error::{Error, Result};
pub use health::{CheckMethod, HealthChecker, HealthVerdict};
pub use lock::LockManager;
pub use node::{Node, NodeUpdate, Wallet};
pub use supervisor::Supervisor;

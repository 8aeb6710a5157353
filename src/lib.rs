pub mod amount;
pub mod config;
pub mod csv;
pub mod engine;
pub mod ids;
pub mod model;
pub mod resources;

pub use amount::Amount;
pub use config::SagaConfig;
pub use engine::{Engine, Outcome, TransactionRecord};
pub use model::{AccountKey, Bank, Party, TransferRequest};

pub mod aggregate;
pub mod change;
pub mod config;
pub mod error;
pub mod field;
pub mod filter;
pub mod formula;
pub mod impact;
pub mod ops;
pub mod query;
pub mod table;
pub mod telemetry;
pub mod traits;
pub mod types;

pub use aggregate::*;
pub use change::*;
pub use config::{ComputeConfig, ENV_PREFIX};
pub use error::*;
pub use field::*;
pub use filter::*;
pub use formula::*;
pub use impact::*;
pub use ops::*;
pub use query::*;
pub use table::*;
pub use telemetry::init_tracing;
pub use traits::*;
pub use types::*;

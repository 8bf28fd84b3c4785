//! Small-area population estimation: fits a nationality × visa × age × gender
//! table to independently reported marginals by iterative proportional fitting.

pub mod aggregate;
pub mod category;
pub mod config;
pub mod cube;
pub mod engine;
pub mod error;
pub mod event;
pub mod marginal;
pub mod record;
pub mod seed;
pub mod solver;
pub mod trend;
pub mod types;

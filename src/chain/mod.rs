//! Function chains: building, caching and execution

pub mod builder;
pub mod cache;
pub mod executor;

pub use builder::{BulkerSettings, FunctionChainBuilder};
pub use cache::ChainCache;
pub use executor::{
    check_error, run_chain, ChainFilter, ChainResult, ChainServices, FunctionExecLog,
    FunctionExecRes,
};

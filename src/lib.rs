pub mod abi;
pub mod branch;
pub mod bytecode;
pub mod config;
pub mod r#const;
pub mod contract;
pub mod error;
pub mod evm;
pub mod executor;
pub mod fuzzer;
pub mod logger;
pub mod mutator;
pub mod oracle;
pub mod oracle_event;
pub mod persist;
pub mod scheduler;
pub mod srcmap;
pub mod types;

pub mod adapter;

pub use adapter::{EvmAdapter, OpcodeContext, Savepoint, StepOutcome};

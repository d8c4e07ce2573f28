//! Graph rewrite passes.

mod dead_code;
mod freeze;
mod permute;
mod unroll;

pub use dead_code::eliminate_dead_code;
pub use freeze::FreezeModulePass;
pub use permute::EliminatePermutationsPass;
pub use unroll::UnrollConstantLoopsPass;

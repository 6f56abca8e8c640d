pub mod catalog;
pub mod engine;
pub mod error;
pub mod gate;
pub mod index;
pub mod outcome;
pub mod paths;
pub mod pipeline;
pub mod reconcile;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

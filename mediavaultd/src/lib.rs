pub mod backend;
pub mod daemon;
pub mod logging;
pub mod manifest;
pub mod model;
pub mod shutdown;
pub mod sync;
pub mod token_provider;

#[cfg(test)]
mod test_support;

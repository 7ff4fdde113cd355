pub mod artifact;
pub mod compose;
pub mod dataset;
pub mod fetch;
pub mod hub;
pub mod labels;
pub mod lora;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod task;
pub mod train;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

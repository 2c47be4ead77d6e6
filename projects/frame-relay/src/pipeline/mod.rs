// Frame relay pipeline: source, workers, progress, store and reassembly

pub mod annotate;
pub mod codec;
pub mod detection;
pub mod detection_worker;
pub mod finalize;
pub mod orchestrator;
pub mod progress;
pub mod reader;
pub mod remote;
pub mod store;
pub mod types;
pub mod worker_pool;

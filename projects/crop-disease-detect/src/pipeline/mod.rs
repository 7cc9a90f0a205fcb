// Detection and streaming pipeline

pub mod annotate;
pub mod detection;
pub mod finalize;
pub mod frame_loop;
pub mod labels;
pub mod orchestrator;
pub mod types;

// 交易对流水线与编排
pub mod instrument_worker;
pub mod orchestrator;

pub use instrument_worker::{InstrumentWorker, WorkerCommand, WorkerHandle, WorkerStatus};
pub use orchestrator::{HealthReport, Orchestrator, OrchestratorHandle};

// 订单执行模块
pub mod executor;
pub mod state_machine;
pub mod trailing_stop;

pub use executor::{ExecutionContext, ExecutionOutcome, ExecutorCommand, ExecutorHandle, PositionExecutor};
pub use state_machine::{Position, PositionEvent, PositionState};
pub use trailing_stop::TrailingStop;

//! DFU transfer engine: the three-state FSM and the manager gluing it to
//! page memory, NVM, and the fault injector.

mod fsm;
mod manager;

pub use fsm::{DfuFsm, DfuState};
pub use manager::DfuManager;

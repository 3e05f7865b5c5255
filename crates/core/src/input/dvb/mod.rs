//! DVB input: frontend state machine, tuning parameter model, delivery
//! systems and the raw Linux DVB API bindings.

pub mod data;
pub mod delivery;
pub mod frontend;
pub mod sys;

pub use frontend::Frontend;

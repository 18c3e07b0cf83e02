pub mod engine;
pub mod states;

pub use engine::{EngineInput, EngineReply, SessionEngine};
pub use states::{CallbackAction, CallbackData, SessionState, ASSIGNEE_PAGE_SIZE};

mod document;
mod executor;
mod messages;
mod state_machine;

pub use document::*;
pub use executor::*;
pub use messages::*;
pub use state_machine::*;

pub mod dispatcher;
pub mod message;
pub mod sdp;
pub mod transaction;

pub use dispatcher::Dispatcher;
pub use message::{build_request, parse, SipMessage};
pub use transaction::TimerConfig;

//! Domain values flowing through the dispatch engine.

mod message;
mod result;

pub use message::{Message, MessageBuilder, MessageFormat, Target, TargetType};
pub use result::{PlatformReceipt, SendResult, TargetState};

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod queue;
pub mod router;

pub use envelope::Envelope;
pub use errors::RouteError;
pub use queue::{BoundedQueue, ChannelQueue, DiscardQueue};
pub use router::{JsonRouter, MessageRouter};

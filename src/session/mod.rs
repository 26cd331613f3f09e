// Session transport: typed topics, request/response over in-process channels

mod error;
mod hub;
mod port;
pub mod protocol;


pub use error::SessionError;
pub use hub::SessionHub;
pub use port::{SessionId, SessionPort};
pub use protocol::{
    Envelope, FrameStateMessage, SubscribeRequest, SubscribedNotice, SubscriptionOptions, Topic,
    UnsubscribeRequest, UnsubscribedNotice,
};

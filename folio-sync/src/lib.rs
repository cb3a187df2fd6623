//! Live annotation sync for one open document.

mod channel;
mod error;
mod policy;
mod protocol;
mod sink;
mod token;
mod transport;

pub use channel::{AnnotationChannel, AnnotationSink, ChannelStatus};
pub use error::SyncError;
pub use policy::{CloseKind, ReconnectPolicy, RetryDecision};
pub use protocol::{
    channel_url, AnnotationRecord, DeletedRef, HighlightRecord, InboundEvent, OutboundEvent,
};
pub use sink::StoreSink;
pub use token::{HttpTokenSource, TokenSource};
pub use transport::{Connector, Frame, SocketConnection, WsConnector};

//! Realtime session channel.
//!
//! ```text
//! SocketTransport ──connect──▶ (FrameSink, FrameStream)
//!                                   │           │
//!            SessionChannel::send ──┘           └──▶ reader task ──▶ subscribers
//!                                                        │
//!                                              ReconnectPolicy on drop
//! ```

pub mod protocol;
pub mod reconnect;
pub mod session_channel;
pub mod transport;
pub mod websocket;

pub use protocol::{InboundEvent, OutboundEvent};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use session_channel::{ChannelClosed, ChannelState, SessionChannel, Subscription};
pub use transport::{Frame, FrameSink, FrameStream, MockConnect, MockSocketTransport, SocketTransport};
pub use websocket::WebSocketTransport;

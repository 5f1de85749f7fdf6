//! Socket IPC layer: wire framing plus the request/response/signal
//! multiplexer the host endpoint is built on.

mod frame;
mod service;

pub use frame::{
    next_message_id, next_peer_id, Frame, FrameKind, ERR_HANDLER_ERROR, ERR_NO_SUCH_METHOD,
    ERR_PEER_DISCONNECTED, ERR_SERVICE_STOPPED, ERR_TIMED_OUT,
};
pub use service::{MethodHandler, PeerCallback, PeerId, ResultCallback, Service, SignalHandlerFn};

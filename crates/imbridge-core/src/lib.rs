//! imbridge-core: pure domain logic for the chat relay bridge.
//! Captured/relay event types, echo and duplicate suppression, session
//! identity tracking and the consumer socket protocol. No IO, no async.

pub mod echo;
pub mod protocol;
pub mod registry;
pub mod types;

pub use echo::{EchoFilter, EchoFilterConfig, EchoReason, Verdict};
pub use protocol::{BridgeMessage, BridgeStatus, ConsumerCommand, ProtocolError, SessionList};
pub use registry::{FocusState, SessionRegistry};
pub use types::{
    AttachmentRef, CaptureOrigin, CapturedEvent, Direction, MessageKind, RelayEvent,
    SessionRecord, SessionScope,
};

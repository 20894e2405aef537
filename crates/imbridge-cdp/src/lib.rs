//! imbridge-cdp: IO boundary to the host application's remote control
//! endpoint (Chrome DevTools Protocol).
//! Target discovery, the per-target session, the connector that supervises
//! attachment, the observation injector and the in-page messaging helpers.
//! No relay logic lives here.

pub mod connector;
pub mod dialer;
pub mod error;
pub mod inject;
pub mod messaging;
pub mod page;
pub mod scripts;
pub mod session;
pub mod target;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connector::{Connector, ReconnectOutcome};
pub use dialer::{DevtoolsDialer, TargetDialer};
pub use error::CdpError;
pub use inject::{CaptureMechanism, CaptureSource, InstallReport, Injector};
pub use page::PageEvaluator;
pub use session::CdpSession;
pub use target::{RemoteTarget, rank_targets};

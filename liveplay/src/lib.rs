pub mod capture;
pub mod connector;
pub mod error;
pub mod heartbeat;
pub mod hls;
pub mod machine;
pub mod native;
pub mod peer;
pub mod presence;
pub mod readiness;
pub mod session;
pub mod signaling;
pub mod sink;
pub mod transport;

pub use capture::{CaptureAuthority, SharedCapture};
pub use connector::DefaultConnector;
pub use error::SessionError;
pub use machine::{Delivery, Notice, Source, State};
pub use session::MediaSession;
pub use signaling::{IceSource, Signaling};
pub use sink::{Frame, OutputSink};

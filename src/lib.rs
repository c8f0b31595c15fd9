pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod metrics;
pub mod output;
pub mod session;
pub mod supervisor;
pub mod transcoder;

pub use config::Config;
pub use error::SessionError;
pub use events::{Event, EventBus, Subscription};
pub use http::{create_router, AppState};
pub use metrics::{MetricsSampler, MetricsSnapshot};
pub use output::{OutputPublisher, PublisherConfig, Segment};
pub use session::{
    Protocol, SessionId, SessionRegistry, SessionSnapshot, SessionState, StreamInput,
};
pub use supervisor::{BackoffPolicy, SessionManager, StopAck, SupervisorConfig};
pub use transcoder::{
    ExitClass, FfmpegAdapter, FfmpegConfig, StartRequest, TranscoderAdapter, TranscoderHandle,
};

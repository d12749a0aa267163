//! # Parley Core
//!
//! The data model shared by every Parley layer.
//!
//! - [`RequestContext`]: one inbound interaction, as normalized by an adapter
//! - [`Response`]: what the adapter should do in reply
//! - [`Event`]: a side-channel notification for the event bus
//! - [`Metrics`]: the capability metrics backends implement
//!
//! ```text
//! ┌─────────┐  RequestContext  ┌────────┐  Arc<RequestContext>  ┌─────────┐
//! │ Adapter │─────────────────▶│ Router │──────────────────────▶│ Handler │
//! │         │◀─────────────────│        │◀──────────────────────│         │
//! └─────────┘     Response     └────────┘       Response        └─────────┘
//! ```

pub mod context;
pub mod event;
pub mod metrics;
pub mod response;

pub use context::{
    InteractionKind, PermissionFn, RequestContext, RequestContextBuilder, UNKNOWN_SOURCE,
    UserProfile,
};
pub use event::{Event, topics};
pub use metrics::{Metrics, NoopMetrics, Tags};
pub use response::{
    Button, ButtonAction, CallbackAnswer, DeliveryOptions, Keyboard, KeyboardKind, Media,
    MediaKind, MessageContent, Outgoing, ParseMode, Response,
};

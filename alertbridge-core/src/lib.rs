//! Pure model for keeping on-call alerts in sync with access requests.
//!
//! Nothing in this crate performs I/O. The server crate feeds request
//! snapshots through these types and turns the results into alert calls.

pub mod note;
pub mod plugin_data;
pub mod recipients;
pub mod request;
pub mod resolution;

pub use note::{resolution_note, review_note, NewAlert};
pub use plugin_data::{AlertId, PluginData};
pub use recipients::{RecipientResolver, DEFAULT_NOTIFY_ANNOTATION, DEFAULT_RESPONDERS_ANNOTATION};
pub use request::{AccessRequest, ProposedState, RequestId, RequestState, Review, Thresholds};
pub use resolution::{resolve, Advance, Resolution, ResolutionTag};

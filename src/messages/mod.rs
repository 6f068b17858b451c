//! Wire types shared by every service: job documents, listener messages,
//! status levels, and the tagged inbound-message algebra.

mod document;
mod inbound;
mod listener;
mod status;

pub use document::{DocumentError, JobDocument, UtcTime};
pub use inbound::{CreatorMessage, ParseError, ServiceMessage};
pub use listener::ListenerMessage;
pub use status::{JobStatus, NotificationType};

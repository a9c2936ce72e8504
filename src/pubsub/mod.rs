//! Topic-exchange publish/subscribe, spec.md §4.5 and §4.6.

pub mod publisher;
pub mod subscriber;

pub use publisher::{PublishOptions, Publisher};
pub use subscriber::Subscriber;

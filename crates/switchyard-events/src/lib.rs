//! Switchyard Events - Event bus for the Switchyard task router.
//!
//! This crate provides:
//! - [`SwitchyardEvent`], the notifications emitted by the plugin subsystem
//! - A broadcast-based [`EventBus`] for async subscribers
//!
//! # Example
//!
//! ```rust
//! use switchyard_events::{EventBus, EventMetadata, SwitchyardEvent};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut receiver = bus.subscribe();
//!
//! bus.publish(SwitchyardEvent::PluginEnabled {
//!     metadata: EventMetadata::new("plugins"),
//!     plugin_id: "word-count".to_string(),
//! });
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.event_type(), "plugin_enabled");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bus;
mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::{EventMetadata, SwitchyardEvent};

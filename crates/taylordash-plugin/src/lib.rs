//! TaylorDash plugin event distribution.
//!
//! Plugins run in isolated sandboxes and never talk to the broker directly.
//! The host-side [`EventRouter`] mirrors a fixed set of broker topics and
//! fans each event out to the sandboxes that asked for it; inside a
//! sandbox, [`SandboxClient`] negotiates subscriptions and invokes plugin
//! callbacks. Both sides validate message origins against an allowlist.

pub mod channel;
pub mod error;
pub mod origin;
pub mod protocol;
pub mod registry;
pub mod sandbox;

pub use channel::{same_handle, ChannelError, HostChannel, QueueChannel, SandboxChannel, SandboxHandle};
pub use error::PluginError;
pub use origin::OriginAllowlist;
pub use protocol::{AckStatus, HostMessage, SandboxMessage, SandboxStatus};
pub use registry::{EventRouter, RouterConfig, RouterStats};
pub use sandbox::{SandboxCallback, SandboxClient, SandboxSubscription};

//! # RTSP source plugin core
//!
//! A media-bridging plugin for a WebRTC gateway: each attached peer's
//! RTP/RTCP is piped over loopback UDP into a per-session media pipeline
//! and re-exposed as a mountpoint on an embedded RTSP server, while RTCP
//! from the pipeline side is relayed back toward the peer. Live
//! mountpoints are mirrored into an external HTTP registry and kept fresh
//! with periodic keepalives.
//!
//! ## Core components
//!
//! - **[`plugin::Plugin`]**: the host-facing surface (session lifecycle,
//!   message queue, RTP/RTCP relay entry points) and owner of all
//!   process-wide state
//! - **[`session`]**: per-peer state and the controller that negotiates
//!   codecs, provisions the loopback socket fleet and publishes the
//!   mountpoint
//! - **[`rtsp`]**: the RTSP server actor — a dedicated thread owning the
//!   mountpoint table, driven through a typed command queue
//! - **[`sdp`]**, **[`rtcp`]**: the small slices of SDP and RTCP this
//!   plugin actually needs
//! - **[`ports`]**, **[`net`]**: the bounded UDP port pool and the socket
//!   factory gluing gateway and pipeline together
//! - **[`registry`]**: the HTTP-JSON client for the stream registry
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rtsp_source::{Plugin, PluginConfig};
//!
//! let gateway = Arc::new(MyGateway::default());
//! let mut plugin = Plugin::init_with_config(gateway, PluginConfig::default())?;
//! plugin.create_session(1)?;
//! // ... feed messages and media through the host surface ...
//! plugin.destroy();
//! ```

pub mod config;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod plugin;
pub mod ports;
pub mod registry;
pub mod rtcp;
pub mod rtsp;
pub mod sdp;
pub mod session;

pub use config::PluginConfig;
pub use error::{ApiError, Error, Result};
pub use plugin::{GatewayCallbacks, MessageResult, Plugin};
pub use sdp::Codec;
pub use session::Session;

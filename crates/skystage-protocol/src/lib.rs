//! # skystage-protocol
//!
//! Wire protocol for the SkyStage collaboration relay.
//!
//! Editors of the same drone show exchange named events (`show:join`,
//! `formation:move`, `cursor:move`, ...) through a relay server. This crate
//! defines the frames those events travel in, their typed payloads, and the
//! codec used on the socket.
//!
//! ## Example
//!
//! ```rust
//! use skystage_protocol::{codec, events::JoinShow, Frame};
//!
//! let frame = Frame::intent(&JoinShow {
//!     room_id: "show-42".into(),
//!     user_id: "user-1".into(),
//! })
//! .unwrap();
//!
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//! ```

pub mod codec;
pub mod events;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use events::{names, Intent};
pub use frames::{error_codes, Frame, FrameKind};
pub use version::{Version, PROTOCOL_VERSION};

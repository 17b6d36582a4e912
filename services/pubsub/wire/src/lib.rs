//! Connection header codec, topic names and message type descriptors for pubsub.
//!
//! This crate provides the handshake side of a topic connection: the binary
//! connection header exchanged when a subscriber connects to a publisher,
//! absolute topic name normalization, and the message type identity that
//! both ends advertise.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-------------------------------------+
//! | u32 LE total_len     | bytes of all field records below    |
//! +----------------------+-------------------------------------+
//! | u32 LE record_len    | "callerid=/talker"                  |
//! +----------------------+-------------------------------------+
//! | u32 LE record_len    | "topic=/chatter"                    |
//! +----------------------+-------------------------------------+
//! | ...                  | type, message_definition, md5sum    |
//! +----------------------+-------------------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust
//! use pubsub_wire::{ConnectionHeader, MessageType, TopicName};
//!
//! let ty = MessageType::new("std_msgs/String").with_md5sum("992ce8a1687cec8c8bd883ec73ca41d1");
//! let header = ConnectionHeader::for_topic("/talker", &TopicName::new("chatter"), &ty);
//!
//! let bytes = header.to_bytes().unwrap();
//! assert_eq!(ConnectionHeader::decode(&bytes).unwrap(), header);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod io;
pub mod topic;

// Re-export main types
pub use error::{DecodeError, EncodeError, HeaderIoError};
pub use header::{ConnectionHeader, Field, LEN_PREFIX_SIZE};
pub use io::{read_header, write_header, MAX_HEADER_SIZE};
pub use topic::{to_absolute_name, MessageType, TopicName, NAME_SEPARATOR};

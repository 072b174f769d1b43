//! DStore Protocol - binary wire format
//!
//! Every exchange is a single framed command on a fresh TCP connection:
//! the client writes a command name followed by its fields, the server
//! answers and the connection is closed. [`frame`] holds the primitive
//! encoders, [`message`] the typed request sets of the DIR and the OSD.

pub mod frame;
pub mod message;

pub use frame::{MAX_FRAME_SIZE, UPLOAD_END};
pub use message::{DirRequest, OsdRequest, Status};

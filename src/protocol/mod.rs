pub mod codec;
pub mod types;

pub use codec::{decode_all, decode_frame, encode_frame, encode_task, Frame};
pub use types::*;

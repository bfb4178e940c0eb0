mod bounded_string;
mod error;
mod frame;
mod sanitize;

pub use bounded_string::{BoundedString, MAX_STRING_LEN};
pub use error::{ChatError, FramingError};
pub use frame::{Frame, Opcode, StatusCode, encode_deliver, encode_status, read_frame};
pub use sanitize::{SanitizeMode, sanitize};

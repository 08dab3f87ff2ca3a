pub mod resp;

pub use resp::{encode_command, read_response, RespValue};

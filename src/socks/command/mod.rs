//! SOCKS5 requests and replies

mod parser;
mod reply;

pub use parser::{parse_command, ParsedRequest, RequestRejection};
pub use reply::{
    build_reply, encode_reply, send_address_type_not_supported, send_command_not_supported,
    send_dial_error, send_success,
};

pub mod buf;
pub mod dedup;
pub mod datagram_buf;
pub mod object_pool;
pub mod safe_converter;

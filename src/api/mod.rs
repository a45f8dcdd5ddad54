pub mod api_key_gate;
pub mod authentication;
pub mod client;
pub mod request_id;

pub mod access_log;
pub mod http_handler;
pub mod readiness;
pub mod server;

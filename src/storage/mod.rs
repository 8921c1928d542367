pub mod connection_log;

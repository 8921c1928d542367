pub mod abuse_detector;
pub mod client_window;
pub mod exclusion;

pub mod diagnostics;
pub mod gate;
pub mod icmp;
pub mod prober;

pub mod observation;
pub mod probe;

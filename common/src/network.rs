pub mod dialer;
pub mod range;
pub mod target;

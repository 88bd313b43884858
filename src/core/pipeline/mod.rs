pub mod judging;
pub mod session;

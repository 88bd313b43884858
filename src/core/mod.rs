pub mod diagnostic;
pub mod domain;
pub mod errors;
pub mod knowledge;
pub mod pipeline;
pub mod probe;
pub mod submission;
pub mod toolchain;
pub mod traits;

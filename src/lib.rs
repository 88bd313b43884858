pub mod analysis;
pub mod constants;
pub mod core;
pub mod stubs;
pub mod systemd;

#[cfg(test)]
mod integration_test;

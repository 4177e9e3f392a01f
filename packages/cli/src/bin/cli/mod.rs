pub mod cleanup;
pub mod run;
pub mod sessions;

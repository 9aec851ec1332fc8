//! Encoder invocation plans

pub mod args;

pub use args::{metadata_copy_args, plan_encode, EncodeStep};

#![no_std]

extern crate alloc;

pub mod arena;
pub mod bio;
pub mod bucket;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fake_device;
pub mod group;
pub mod log;
pub mod qnode;
pub mod squeue;
pub mod sync;
pub mod timer;

pub use engine::ThrottleEngine;
pub use error::{ThrottleError, ThrottleResult};

#![allow(dead_code)]

pub mod stages;

pub use stages::*;

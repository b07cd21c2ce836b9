#![no_std]

extern crate alloc;

pub mod address;
pub mod asset;
pub mod commitment;
pub mod error;
pub mod mssmt;
pub mod proof;
pub mod tlv;

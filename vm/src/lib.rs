//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! The [`mem::VmSystem`] owns the global frame table and swap space. Each
//! process gets an [`mem::AddressSpace`] whose supplemental page table
//! records how to materialize every user page, and which pages are
//! currently resident.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod sync;

pub use config::VmConfig;
pub use error::{Result, VmError};

//! Core types shared by every muon crate.
//!
//! The emulator deals in two address spaces: the guest's flat 32-bit space
//! and the host's. This crate provides the [`GuestAddr`] newtype that keeps
//! the two from mixing at the type level, plus the page constants and
//! alignment helpers used throughout the runtime.

pub mod addr;

pub use addr::{align_up, page_align_up, GuestAddr, PAGE_MASK, PAGE_SIZE};

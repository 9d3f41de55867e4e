//! Internal error type for fallible helpers.
//!
//! The public surface (`alloc`/`free`, `GlobalAlloc`) never exposes this —
//! it collapses every failure to a null return, per contract. Internal
//! tiers use it so call sites can distinguish "the OS is out of memory"
//! from "the request itself cannot be satisfied" before flattening to null.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The OS declined to map further pages.
    OutOfMemory,
    /// The request cannot be rounded/represented without overflow.
    InvalidArgument,
}

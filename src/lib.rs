#![doc = include_str!("RUSTDOC.md")]

pub mod firestore;
pub mod platform;
pub mod util;

#[cfg(test)]
mod test_support;

//! Terminal backends: slaves that do not delegate to another PCM.

pub mod file;
pub mod null;
pub mod share;

#[cfg(test)]
pub(crate) mod mock;

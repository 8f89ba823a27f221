#![allow(dead_code)]
#![allow(unused_imports)]

pub mod correspondence;
pub mod gateway;
pub mod layer;
pub mod residual;
pub mod selection;
pub mod session;

#[cfg(test)]
pub(crate) mod test_utils;

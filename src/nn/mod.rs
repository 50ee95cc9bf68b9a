pub mod gpu;
pub mod model;
pub mod persistence;

pub use model::{UNet, UNetConfig};

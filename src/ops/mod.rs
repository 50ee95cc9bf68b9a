pub mod one_hot;
pub mod predict;
pub mod sliding_window;

pub use one_hot::{to_onehot, to_onehot_float};
pub use predict::predict_segmentation;
pub use sliding_window::sliding_window_inference;

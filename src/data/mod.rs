pub mod dataset;
pub mod models;
pub mod nifti;
pub mod synthetic;
pub mod transforms;

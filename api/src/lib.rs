/*
 * kwatch/api - custom resource types watched by the kwatch controllers
 */

pub mod sample;
pub use sample::Sample;
pub use sample::SampleSpec;
pub use sample::SampleStatus;

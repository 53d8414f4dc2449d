//! Statistical engine: GLM t-tests, CFE enhancement and permutation testing

pub mod cfe;
pub mod glm;
pub mod math;
pub mod permute;

//! fixelcfe: whole-brain fixel-based statistical analysis
//!
//! Implements the core of a fixel-based analysis pipeline: fixel-fixel
//! connectivity from streamline tractography, connectivity-weighted smoothing
//! of per-subject fixel data, GLM t-tests with non-parametric permutation
//! testing, and connectivity-based fixel enhancement (CFE) with family-wise
//! error corrected p-values.
//!
//! # Modules
//! - `mif`: MRtrix image (.mif/.mif.gz) I/O
//! - `fixel`: fixel atlas loading (index + directions)
//! - `tracks`: .tck streamline reading
//! - `mapper`: streamline -> voxel sample mapping
//! - `connectivity`: connectivity graph build, normalisation, smoothing weights
//! - `smooth`: NaN-aware data smoothing
//! - `stats`: GLM engines, CFE integrator, permutation testing

pub mod connectivity;
pub mod error;
pub mod fixel;
pub mod mapper;
pub mod mif;
pub mod smooth;
pub mod stats;
pub mod tracks;

pub use error::{FixelError, FixelResult};

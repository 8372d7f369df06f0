//! Calibration profiles and the in-memory table that holds them.
//!
//! The store performs no file I/O. A persistence collaborator moves
//! profiles in and out with `export_all` / `import_all`.

mod model;
mod store;

pub use model::Profile;
pub use store::ProfileStore;

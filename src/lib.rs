//! VDC - VAPOR Data Collection
//!
//! A pure Rust implementation of the VAPOR Data Collection: a catalog of
//! dimensions and variables over gridded scientific arrays, stored with
//! block wavelet compression so that data can be read back at coarser grid
//! resolutions and at reduced levels of detail.
//!
//! # Features
//!
//! - Up to three spatial dimensions plus time per variable
//! - Biorthogonal lifting wavelets (bior1.1, bior2.2, bior4.4) applied per block
//! - Progressive levels of detail, one file per compression ratio
//! - Coarsened refinement levels decoded from approximation coefficients
//! - Multithreaded block encode and decode
//! - Local filesystem backend (implement [`IoManager`] for other storage)
//!
//! # Example
//!
//! ```rust,no_run
//! use vdc::{AccessMode, Axis, DataVarDef, Vdc};
//!
//! # fn example() -> vdc::Result<()> {
//! let mut vdc = Vdc::initialize("/data/run.nc", AccessMode::Write)?;
//! vdc.define_dimension("x", 256, Axis::X)?;
//! vdc.define_dimension("y", 256, Axis::Y)?;
//! vdc.define_dimension("z", 128, Axis::Z)?;
//! vdc.define_data_var(
//!     DataVarDef::new("temp", &["x", "y", "z"], &["x", "y", "z"]).compressed(true),
//! )?;
//! vdc.end_define()?;
//!
//! let field = vec![0.0f32; 256 * 256 * 128];
//! vdc.put_var("temp", -1, &field)?;
//! vdc.close()?;
//! # Ok(())
//! # }
//! ```

pub mod attribute;
pub mod catalog;
pub mod codec;
pub mod compression;
pub mod config;
pub mod container;
pub mod error;
pub mod io;
pub mod layout;
pub mod sigmap;
pub mod types;
pub mod vdc;
pub mod vdc_file;
pub mod wasp;
pub mod wavelet;

// Re-exports
pub use attribute::{AttrValues, Attribute};
pub use catalog::{
    Catalog, CompressionParams, CoordVar, CoordVarDef, DataVar, DataVarDef, Dimension, VarBase,
};
pub use compression::PayloadCodec;
pub use config::VdcConfig;
pub use error::{ErrorKind, Result, VdcError};
pub use io::{FileSystemIoManager, IoManager};
pub use types::{AccessMode, Axis, XType};
pub use vdc::{VarPath, Vdc, VdcBackend};
pub use vdc_file::{VdcFile, VDC_VERSION};
pub use wasp::{WaspFile, WaspOptions, WaspVarParams};

/// Version of this crate
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!CRATE_VERSION.is_empty());
        assert_eq!(VDC_VERSION, 1);
    }
}

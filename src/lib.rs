//! Blocked, multithreaded level-3 dense matrix operations.
//!
//! Every operation runs the same five-loop skeleton: columns of `C` in `NC`
//! blocks, the inner dimension in `KC` blocks with a packed panel of `B`,
//! rows of `C` in `MC` blocks with a packed block of `A`, and a register-tile
//! compute primitive over `NR x MR` tiles. Which loops run in which direction,
//! what gets packed with which structure, and which loops are split over
//! threads is described by a control tree built per operation.
//!
//! ```
//! use private_level3::{gemm, Config, MatMut, MatRef};
//!
//! let a = [1.0, 2.0, 3.0, 4.0];
//! let b = [1.0, 0.0, 0.0, 1.0];
//! let mut c = [0.0; 4];
//! gemm(
//!     &Config::new().with_threads(1),
//!     1.0,
//!     MatRef::from_col_major(&a, 2, 2).unwrap(),
//!     MatRef::from_col_major(&b, 2, 2).unwrap(),
//!     0.0,
//!     MatMut::from_col_major_mut(&mut c, 2, 2).unwrap(),
//! )
//! .unwrap();
//! assert_eq!(c, a);
//! ```

pub mod blocksize;
pub mod cntl;
pub mod config;
pub mod error;
mod exec;
mod ops;
pub mod pack;
pub mod part;
pub mod scalar;
mod thread;
pub mod ukr;
mod view;
pub mod workspace;

pub use blocksize::{Arch, BlkSz, BlocksizeTable, Blocksizes, BszId};
pub use config::{Config, Ways};
pub use error::{DimsError, Error, Result};
pub use ops::{gemm, gemmt, hemm, her2k, herk, symm, syr2k, syrk, trmm, trmm3, trsm};
pub use scalar::{c32, c64, Dt, Scalar};
pub use ukr::{KernelTable, Kernels};
pub use view::{Diag, MatMut, MatRef, Side, Struc, Uplo};
pub use workspace::{Pool, Workspace};

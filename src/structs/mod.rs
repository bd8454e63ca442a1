//! Wire-format structures for the container family.
//!
//! One module per format: the shared chunk framing, the @UTF table
//! codec, the AFS2 bank, the ADX and HCA headers, and the IVF container
//! the USM builder consumes. Each structure parses from a byte slice and
//! owns its derived buffers.

pub mod adx;
pub mod awb;
pub mod chunk;
pub mod hca;
pub mod ivf;
pub mod utf;

//! Multi-step operations composed from the wire structures.
//!
//! The CRILAYLA codec, the CPK archive reader/builder, the ACB cue
//! resolver and the USM demuxer/builder all live here; each consumes the
//! leaf formats under [`crate::structs`].

pub mod acb;
pub mod cpk;
pub mod crilayla;
pub mod usm;

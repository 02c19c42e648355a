//! Thin library surface for the `taskqueue-agent` binaries: the default
//! stand-ins for the external collaborators spec.md places out of scope
//! (the relational file-record store).

pub mod stub;

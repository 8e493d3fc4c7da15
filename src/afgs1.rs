//! The AFGS1 core: parameter sets, the filmgrn1 table reader, the
//! presentation-time database, the decoder buffer emulation, and the
//! bit-exact payload serializer.

pub mod buffer;
pub mod database;
pub mod params;
pub mod syntax;
pub mod table;

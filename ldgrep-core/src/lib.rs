pub mod binary;
pub mod elf;
pub mod macho;
mod reader;

pub use binary::*;
pub use elf::*;
pub use macho::*;
pub use reader::Endian;

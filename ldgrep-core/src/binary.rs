use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use crate::elf::ElfObject;
use crate::macho::MachObject;

/// Why a stream could not be identified.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Neither decoder recognized the leading magic. Expected during
    /// format probing; the stream has been rewound to offset zero.
    #[error("unrecognized object format")]
    Unrecognized,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The format-specific half of an identified binary.
#[derive(Debug)]
pub enum Format {
    Elf(ElfObject),
    MachO(MachObject),
}

/// An identified executable image over a seekable stream.
///
/// Identification tries ELF first and falls back to Mach-O; exactly one
/// decoder ever claims a stream.
#[derive(Debug)]
pub struct Binary<R> {
    reader: R,
    format: Format,
}

impl Binary<BufReader<File>> {
    /// Opens and identifies the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        let file = File::open(path)?;
        Self::identify(BufReader::new(file))
    }
}

impl<R: Read + Seek> Binary<R> {
    /// Identifies the stream. On [`FormatError::Unrecognized`] the stream
    /// has been rewound to offset zero and is otherwise untouched.
    pub fn identify(mut reader: R) -> Result<Self, FormatError> {
        if let Some(elf) = ElfObject::parse(&mut reader)? {
            return Ok(Self {
                reader,
                format: Format::Elf(elf),
            });
        }
        // Each probe rewinds on entry, so the Mach-O decoder re-reads the
        // same identification bytes from offset zero.
        if let Some(macho) = MachObject::parse(&mut reader)? {
            return Ok(Self {
                reader,
                format: Format::MachO(macho),
            });
        }
        reader.seek(SeekFrom::Start(0))?;
        Err(FormatError::Unrecognized)
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn format_name(&self) -> &'static str {
        match self.format {
            Format::Elf(_) => "ELF",
            Format::MachO(_) => "Mach-O",
        }
    }

    /// Shared-library dependency names in link order. Possibly empty;
    /// truncation never fails the call.
    pub fn dependencies(&mut self) -> io::Result<Vec<String>> {
        match &self.format {
            Format::Elf(elf) => elf.dependencies(&mut self.reader),
            Format::MachO(macho) => macho.dependencies(&mut self.reader),
        }
    }

    /// Gives the underlying stream back to the caller.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

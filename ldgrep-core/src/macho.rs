use std::io::{self, Read, Seek, SeekFrom};

use crate::reader::{decode_name, read_record, read_up_to, Endian, Record};

/// 64-bit thin Mach-O magic as the leading word reads little-endian.
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
/// Byte-swapped form, marking a big-endian object.
pub const MH_CIGAM_64: u32 = 0xCFFA_EDFE;

/// Load command naming a required shared library.
const LC_LOAD_DYLIB: u32 = 0x0C;

const MACH_HEADER_SIZE: usize = 32;
const LOAD_COMMAND_SIZE: usize = 8;
const DYLIB_SIZE: usize = 16;

/// Mach-O file header for thin 64-bit objects. Fat/universal containers
/// are rejected at identification.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,
    /// CPU architecture identifier.
    pub cputype: u32,
    pub cpusubtype: u32,
    /// File type (executable, dylib, bundle, ...).
    pub filetype: u32,
    /// Number of load commands; bounds the command walk.
    pub ncmds: u32,
    /// Total size in bytes of the load-command block.
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl MachHeader {
    fn parse(rec: &mut Record) -> Self {
        Self {
            magic: rec.u32(),
            cputype: rec.u32(),
            cpusubtype: rec.u32(),
            filetype: rec.u32(),
            ncmds: rec.u32(),
            sizeofcmds: rec.u32(),
            flags: rec.u32(),
            reserved: rec.u32(),
        }
    }
}

/// Load-command prefix common to every command: type plus total size, the
/// size making unknown commands skippable.
#[derive(Debug, Clone, Copy)]
struct LoadCommand {
    cmd: u32,
    cmdsize: u32,
}

impl LoadCommand {
    fn read<R: Read>(reader: &mut R, endian: Endian) -> io::Result<Option<Self>> {
        let Some(mut rec) = read_record(reader, LOAD_COMMAND_SIZE, endian)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            cmd: rec.u32(),
            cmdsize: rec.u32(),
        }))
    }
}

/// Fixed part of an `LC_LOAD_DYLIB` payload; the library path trails it.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
struct Dylib {
    name_offset: u32,
    timestamp: u32,
    current_version: u32,
    compatibility_version: u32,
}

impl Dylib {
    fn read<R: Read>(reader: &mut R, endian: Endian) -> io::Result<Option<Self>> {
        let Some(mut rec) = read_record(reader, DYLIB_SIZE, endian)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            name_offset: rec.u32(),
            timestamp: rec.u32(),
            current_version: rec.u32(),
            compatibility_version: rec.u32(),
        }))
    }
}

/// An identified thin 64-bit Mach-O image.
#[derive(Debug)]
pub struct MachObject {
    endian: Endian,
    /// The file header as read from offset zero.
    pub header: MachHeader,
}

impl MachObject {
    /// Probes `reader` for a thin Mach-O image. `Ok(None)` means the magic
    /// did not match; the caller may rewind and try another format.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> io::Result<Option<Self>> {
        reader.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        if read_up_to(reader, &mut magic)? < magic.len() {
            return Ok(None);
        }
        let endian = match u32::from_le_bytes(magic) {
            MH_MAGIC_64 => Endian::Little,
            MH_CIGAM_64 => Endian::Big,
            _ => return Ok(None),
        };
        reader.seek(SeekFrom::Start(0))?;
        let Some(mut rec) = read_record(reader, MACH_HEADER_SIZE, endian)? else {
            return Ok(None);
        };
        let header = MachHeader::parse(&mut rec);
        log::debug!("identified {:?} Mach-O, ncmds={}", endian, header.ncmds);
        Ok(Some(Self { endian, header }))
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Dylib load-command paths in encounter order. A truncated command
    /// list yields whatever was extracted before the cut.
    pub fn dependencies<R: Read + Seek>(&self, reader: &mut R) -> io::Result<Vec<String>> {
        reader.seek(SeekFrom::Start(MACH_HEADER_SIZE as u64))?;
        let mut deps = Vec::new();
        for _ in 0..self.header.ncmds {
            let Some(lc) = LoadCommand::read(reader, self.endian)? else {
                return Ok(deps);
            };
            if lc.cmd == LC_LOAD_DYLIB {
                if Dylib::read(reader, self.endian)?.is_none() {
                    return Ok(deps);
                }
                let len = (lc.cmdsize as usize).saturating_sub(LOAD_COMMAND_SIZE + DYLIB_SIZE);
                let mut name = vec![0u8; len];
                if read_up_to(reader, &mut name)? < len {
                    return Ok(deps);
                }
                if let Some(end) = name.iter().position(|&b| b == 0) {
                    name.truncate(end);
                }
                deps.push(decode_name(&name));
            } else {
                let skip = i64::from(lc.cmdsize.saturating_sub(LOAD_COMMAND_SIZE as u32));
                reader.seek(SeekFrom::Current(skip))?;
            }
        }
        Ok(deps)
    }
}

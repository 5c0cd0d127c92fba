use std::io::{self, Read, Seek, SeekFrom};

use crate::reader::{decode_name, read_record, read_up_to, Endian, Record};

/// First four bytes of every ELF file.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// Program-header type marking the dynamic linking table.
const PT_DYNAMIC: u32 = 2;

const DT_NULL: i64 = 0;
const DT_NEEDED: i64 = 1;
const DT_STRTAB: i64 = 5;

/// Chunk size for the string-table NUL scan.
const STRTAB_CHUNK: usize = 64;

/// Word size of an ELF object, from `e_ident[EI_CLASS]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Elf32,
    Elf64,
}

/// Layout selected once from the identification bytes. Every structured
/// read in the same file decodes with it; it is never re-derived mid-parse.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElfLayout {
    pub class: Class,
    pub endian: Endian,
}

impl ElfLayout {
    fn ehdr_size(self) -> usize {
        match self.class {
            Class::Elf32 => 52,
            Class::Elf64 => 64,
        }
    }

    fn phdr_size(self) -> usize {
        match self.class {
            Class::Elf32 => 32,
            Class::Elf64 => 56,
        }
    }

    fn dyn_size(self) -> usize {
        match self.class {
            Class::Elf32 => 8,
            Class::Elf64 => 16,
        }
    }

    /// Reads a class-width unsigned word (`Elf32_Word`/`Elf64_Xword`).
    fn word(self, rec: &mut Record) -> u64 {
        match self.class {
            Class::Elf32 => rec.u32().into(),
            Class::Elf64 => rec.u64(),
        }
    }

    /// Reads a class-width signed word (`Elf32_Sword`/`Elf64_Sxword`).
    fn sword(self, rec: &mut Record) -> i64 {
        match self.class {
            Class::Elf32 => rec.i32().into(),
            Class::Elf64 => rec.i64(),
        }
    }
}

/// ELF file header, normalized to 64-bit field widths.
///
/// Corresponds to `Elf32_Ehdr`/`Elf64_Ehdr` from the ELF specification; the
/// 32-bit variant widens its address and offset fields on read.
///
/// Reference: [ELF Specification v1.2](https://refspecs.linuxfoundation.org/elf/elf.pdf)
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    /// ELF identification bytes (magic number, class, endianness, version).
    pub e_ident: [u8; 16],

    /// Object file type.
    ///
    /// Common values:
    /// - `ET_REL` (1): Relocatable file
    /// - `ET_EXEC` (2): Executable file
    /// - `ET_DYN` (3): Shared object
    pub e_type: u16,

    /// Target architecture (e.g. `EM_X86_64` = 62, `EM_AARCH64` = 183).
    pub e_machine: u16,

    /// ELF version (usually `EV_CURRENT` = 1).
    pub e_version: u32,

    /// Virtual address of the program entry point.
    pub e_entry: u64,

    /// File offset of the program header table, zero when the table is
    /// absent.
    pub e_phoff: u64,

    /// File offset of the section header table.
    pub e_shoff: u64,

    /// Processor-specific flags.
    pub e_flags: u32,

    /// Size of this header in bytes.
    pub e_ehsize: u16,

    /// Size of one entry in the program header table.
    pub e_phentsize: u16,

    /// Number of entries in the program header table; bounds the table
    /// walk.
    pub e_phnum: u16,

    /// Size of one entry in the section header table.
    pub e_shentsize: u16,

    /// Number of entries in the section header table.
    pub e_shnum: u16,

    /// Index of the section header string table.
    pub e_shstrndx: u16,
}

impl ElfHeader {
    fn parse(rec: &mut Record, layout: ElfLayout) -> Self {
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(rec.bytes(16));
        let e_type = rec.u16();
        let e_machine = rec.u16();
        let e_version = rec.u32();
        let e_entry = layout.word(rec);
        let e_phoff = layout.word(rec);
        let e_shoff = layout.word(rec);
        Self {
            e_ident,
            e_type,
            e_machine,
            e_version,
            e_entry,
            e_phoff,
            e_shoff,
            e_flags: rec.u32(),
            e_ehsize: rec.u16(),
            e_phentsize: rec.u16(),
            e_phnum: rec.u16(),
            e_shentsize: rec.u16(),
            e_shnum: rec.u16(),
            e_shstrndx: rec.u16(),
        }
    }
}

/// Program header table entry (`Elf32_Phdr`/`Elf64_Phdr`), normalized to
/// 64-bit widths. The two classes order their fields differently on disk;
/// both decode into this shape.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    /// Segment type; `PT_DYNAMIC` (2) marks the dynamic linking table.
    pub p_type: u32,
    /// Segment flags.
    pub p_flags: u32,
    /// File offset of the segment contents.
    pub p_offset: u64,
    /// Virtual address of the segment.
    pub p_vaddr: u64,
    /// Physical address, where relevant.
    pub p_paddr: u64,
    /// Size of the segment image in the file.
    pub p_filesz: u64,
    /// Size of the segment in memory.
    pub p_memsz: u64,
    /// Alignment constraint.
    pub p_align: u64,
}

impl ProgramHeader {
    fn read<R: Read>(reader: &mut R, layout: ElfLayout) -> io::Result<Option<Self>> {
        let Some(mut rec) = read_record(reader, layout.phdr_size(), layout.endian)? else {
            return Ok(None);
        };
        let ph = match layout.class {
            Class::Elf32 => {
                let p_type = rec.u32();
                let p_offset = rec.u32().into();
                let p_vaddr = rec.u32().into();
                let p_paddr = rec.u32().into();
                let p_filesz = rec.u32().into();
                let p_memsz = rec.u32().into();
                let p_flags = rec.u32();
                let p_align = rec.u32().into();
                Self {
                    p_type,
                    p_flags,
                    p_offset,
                    p_vaddr,
                    p_paddr,
                    p_filesz,
                    p_memsz,
                    p_align,
                }
            }
            Class::Elf64 => {
                let p_type = rec.u32();
                let p_flags = rec.u32();
                Self {
                    p_type,
                    p_flags,
                    p_offset: rec.u64(),
                    p_vaddr: rec.u64(),
                    p_paddr: rec.u64(),
                    p_filesz: rec.u64(),
                    p_memsz: rec.u64(),
                    p_align: rec.u64(),
                }
            }
        };
        Ok(Some(ph))
    }
}

/// Dynamic table entry: a `(d_tag, d_val)` pair, terminated by `DT_NULL`.
#[derive(Debug, Clone, Copy)]
struct DynEntry {
    d_tag: i64,
    d_val: u64,
}

impl DynEntry {
    fn read<R: Read>(reader: &mut R, layout: ElfLayout) -> io::Result<Option<Self>> {
        let Some(mut rec) = read_record(reader, layout.dyn_size(), layout.endian)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            d_tag: layout.sword(&mut rec),
            d_val: layout.word(&mut rec),
        }))
    }
}

/// String table resolved lazily: names are found by seeking to
/// `base + offset` and scanning forward for a NUL in bounded chunks,
/// never reading ahead of what the stream can supply.
struct StringTable {
    base: u64,
}

impl StringTable {
    fn string_at<R: Read + Seek>(&self, reader: &mut R, offset: u64) -> io::Result<Option<String>> {
        reader.seek(SeekFrom::Start(self.base.saturating_add(offset)))?;
        let mut name = Vec::new();
        loop {
            let mut chunk = [0u8; STRTAB_CHUNK];
            let n = read_up_to(reader, &mut chunk)?;
            if let Some(end) = chunk[..n].iter().position(|&b| b == 0) {
                name.extend_from_slice(&chunk[..end]);
                return Ok(Some(decode_name(&name)));
            }
            if n < STRTAB_CHUNK {
                // Stream ended before a terminator; never return a partial
                // name.
                return Ok(None);
            }
            name.extend_from_slice(&chunk[..n]);
        }
    }
}

/// An identified ELF image: the layout chosen at identification plus the
/// file header. Dependency extraction walks the program-header and dynamic
/// tables on demand.
#[derive(Debug)]
pub struct ElfObject {
    layout: ElfLayout,
    /// The file header as read from offset zero.
    pub header: ElfHeader,
}

impl ElfObject {
    /// Probes `reader` for an ELF image. `Ok(None)` means the stream is not
    /// ELF (wrong magic, unknown class byte, or too short for a header);
    /// the caller may rewind and try another format.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> io::Result<Option<Self>> {
        reader.seek(SeekFrom::Start(0))?;
        let mut ident = [0u8; 16];
        if read_up_to(reader, &mut ident)? < ident.len() {
            return Ok(None);
        }
        if ident[..4] != ELF_MAGIC {
            return Ok(None);
        }
        let class = match ident[EI_CLASS] {
            ELFCLASS32 => Class::Elf32,
            ELFCLASS64 => Class::Elf64,
            _ => return Ok(None),
        };
        let endian = if ident[EI_DATA] == ELFDATA2LSB {
            Endian::Little
        } else {
            Endian::Big
        };
        let layout = ElfLayout { class, endian };

        // The header record starts at offset zero so it covers e_ident too.
        reader.seek(SeekFrom::Start(0))?;
        let Some(mut rec) = read_record(reader, layout.ehdr_size(), endian)? else {
            return Ok(None);
        };
        let header = ElfHeader::parse(&mut rec, layout);
        log::debug!(
            "identified {:?} {:?} ELF, e_phnum={}",
            class,
            endian,
            header.e_phnum
        );
        Ok(Some(Self { layout, header }))
    }

    pub fn class(&self) -> Class {
        self.layout.class
    }

    pub fn endian(&self) -> Endian {
        self.layout.endian
    }

    /// File offset of the `PT_DYNAMIC` segment, found by scanning the
    /// program-header table in order. `None` when there is no table, no
    /// dynamic segment, or the table is truncated.
    fn dynamic_offset<R: Read + Seek>(&self, reader: &mut R) -> io::Result<Option<u64>> {
        if self.header.e_phoff == 0 {
            return Ok(None);
        }
        reader.seek(SeekFrom::Start(self.header.e_phoff))?;
        for _ in 0..self.header.e_phnum {
            let Some(ph) = ProgramHeader::read(reader, self.layout)? else {
                return Ok(None);
            };
            if ph.p_type == PT_DYNAMIC {
                return Ok(Some(ph.p_offset));
            }
        }
        Ok(None)
    }

    /// Names of the shared libraries this object was linked against, in
    /// link order. Objects without dynamic linking information, and
    /// truncated objects, yield an empty list.
    pub fn dependencies<R: Read + Seek>(&self, reader: &mut R) -> io::Result<Vec<String>> {
        // A segment offset of zero doubles as "no dynamic segment".
        let dyn_offset = match self.dynamic_offset(reader)? {
            Some(offset) if offset != 0 => offset,
            _ => return Ok(Vec::new()),
        };
        reader.seek(SeekFrom::Start(dyn_offset))?;

        let mut needed = Vec::new();
        let mut strtab_offset = 0u64;
        loop {
            let Some(entry) = DynEntry::read(reader, self.layout)? else {
                // Table truncated before its DT_NULL terminator; nothing
                // has been resolved yet.
                return Ok(Vec::new());
            };
            match entry.d_tag {
                DT_NULL => break,
                DT_NEEDED => needed.push(entry.d_val),
                // Last one wins if the table carries several.
                DT_STRTAB => strtab_offset = entry.d_val,
                _ => {}
            }
        }
        if strtab_offset == 0 {
            if !needed.is_empty() {
                log::warn!(
                    "{} DT_NEEDED entries but no DT_STRTAB; names are unresolvable",
                    needed.len()
                );
            }
            return Ok(Vec::new());
        }

        let strtab = StringTable {
            base: strtab_offset,
        };
        let mut deps = Vec::with_capacity(needed.len());
        for offset in needed {
            match strtab.string_at(reader, offset)? {
                Some(name) => deps.push(name),
                None => break,
            }
        }
        Ok(deps)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const LAYOUTS: [ElfLayout; 4] = [
        ElfLayout {
            class: Class::Elf32,
            endian: Endian::Little,
        },
        ElfLayout {
            class: Class::Elf32,
            endian: Endian::Big,
        },
        ElfLayout {
            class: Class::Elf64,
            endian: Endian::Little,
        },
        ElfLayout {
            class: Class::Elf64,
            endian: Endian::Big,
        },
    ];

    fn push_u16(buf: &mut Vec<u8>, endian: Endian, v: u16) {
        match endian {
            Endian::Little => buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn push_u32(buf: &mut Vec<u8>, endian: Endian, v: u32) {
        match endian {
            Endian::Little => buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn push_u64(buf: &mut Vec<u8>, endian: Endian, v: u64) {
        match endian {
            Endian::Little => buf.extend_from_slice(&v.to_le_bytes()),
            Endian::Big => buf.extend_from_slice(&v.to_be_bytes()),
        }
    }

    fn push_word(buf: &mut Vec<u8>, layout: ElfLayout, v: u64) {
        match layout.class {
            Class::Elf32 => push_u32(buf, layout.endian, v as u32),
            Class::Elf64 => push_u64(buf, layout.endian, v),
        }
    }

    fn ehdr_bytes(layout: ElfLayout, e_phoff: u64, e_phnum: u16) -> Vec<u8> {
        let e = layout.endian;
        let mut buf = Vec::new();
        buf.extend_from_slice(&ELF_MAGIC);
        buf.push(match layout.class {
            Class::Elf32 => ELFCLASS32,
            Class::Elf64 => ELFCLASS64,
        });
        buf.push(match e {
            Endian::Little => 1,
            Endian::Big => 2,
        });
        buf.push(1); // EI_VERSION
        buf.resize(16, 0);
        push_u16(&mut buf, e, 2); // e_type = ET_EXEC
        push_u16(&mut buf, e, 62); // e_machine = EM_X86_64
        push_u32(&mut buf, e, 1); // e_version
        push_word(&mut buf, layout, 0x1000); // e_entry
        push_word(&mut buf, layout, e_phoff);
        push_word(&mut buf, layout, 0); // e_shoff
        push_u32(&mut buf, e, 0); // e_flags
        push_u16(&mut buf, e, layout.ehdr_size() as u16);
        push_u16(&mut buf, e, layout.phdr_size() as u16);
        push_u16(&mut buf, e, e_phnum);
        push_u16(&mut buf, e, 0); // e_shentsize
        push_u16(&mut buf, e, 0); // e_shnum
        push_u16(&mut buf, e, 0); // e_shstrndx
        assert_eq!(buf.len(), layout.ehdr_size());
        buf
    }

    fn phdr_bytes(layout: ElfLayout, p_type: u32, p_offset: u64) -> Vec<u8> {
        let e = layout.endian;
        let mut buf = Vec::new();
        match layout.class {
            Class::Elf32 => {
                push_u32(&mut buf, e, p_type);
                push_u32(&mut buf, e, p_offset as u32);
                buf.resize(layout.phdr_size(), 0);
            }
            Class::Elf64 => {
                push_u32(&mut buf, e, p_type);
                push_u32(&mut buf, e, 0); // p_flags
                push_u64(&mut buf, e, p_offset);
                buf.resize(layout.phdr_size(), 0);
            }
        }
        buf
    }

    fn dyn_bytes(layout: ElfLayout, entries: &[(i64, u64)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for &(tag, val) in entries {
            push_word(&mut buf, layout, tag as u64);
            push_word(&mut buf, layout, val);
        }
        buf
    }

    /// Header, one PT_LOAD, one PT_DYNAMIC, dynamic table, string table.
    fn dynamic_fixture(layout: ElfLayout, entries: &[(i64, u64)], strtab: &[u8]) -> Vec<u8> {
        let phoff = layout.ehdr_size();
        let dyn_off = phoff + 2 * layout.phdr_size();
        let mut buf = ehdr_bytes(layout, phoff as u64, 2);
        buf.extend(phdr_bytes(layout, 1, 0)); // PT_LOAD, scanned past
        buf.extend(phdr_bytes(layout, PT_DYNAMIC, dyn_off as u64));
        buf.extend(dyn_bytes(layout, entries));
        buf.extend_from_slice(strtab);
        buf
    }

    fn strtab_off(layout: ElfLayout, n_entries: usize) -> u64 {
        (layout.ehdr_size() + 2 * layout.phdr_size() + n_entries * layout.dyn_size()) as u64
    }

    fn deps_of(buf: Vec<u8>) -> Vec<String> {
        let mut cur = Cursor::new(buf);
        let elf = ElfObject::parse(&mut cur).unwrap().unwrap();
        elf.dependencies(&mut cur).unwrap()
    }

    #[test]
    fn no_program_headers_means_no_deps() {
        for layout in LAYOUTS {
            let buf = ehdr_bytes(layout, 0, 0);
            assert_eq!(deps_of(buf), Vec::<String>::new());
        }
    }

    #[test]
    fn needed_names_resolve_in_encounter_order() {
        for layout in LAYOUTS {
            let strtab = strtab_off(layout, 4);
            let buf = dynamic_fixture(
                layout,
                &[
                    (DT_NEEDED, 0),
                    (DT_STRTAB, strtab),
                    (DT_NEEDED, 10),
                    (DT_NULL, 0),
                ],
                b"libc.so.6\0libm.so.6\0",
            );
            assert_eq!(deps_of(buf), vec!["libc.so.6", "libm.so.6"]);
        }
    }

    #[test]
    fn duplicate_needed_entries_are_preserved() {
        let layout = LAYOUTS[2];
        let strtab = strtab_off(layout, 5);
        let buf = dynamic_fixture(
            layout,
            &[
                (DT_NEEDED, 10),
                (DT_NEEDED, 0),
                (DT_NEEDED, 10),
                (DT_STRTAB, strtab),
                (DT_NULL, 0),
            ],
            b"libc.so.6\0libm.so.6\0",
        );
        assert_eq!(deps_of(buf), vec!["libm.so.6", "libc.so.6", "libm.so.6"]);
    }

    #[test]
    fn needed_without_strtab_yields_nothing() {
        for layout in LAYOUTS {
            let buf = dynamic_fixture(layout, &[(DT_NEEDED, 0), (DT_NULL, 0)], b"libc.so.6\0");
            assert_eq!(deps_of(buf), Vec::<String>::new());
        }
    }

    #[test]
    fn truncated_dynamic_table_yields_nothing() {
        let layout = LAYOUTS[2];
        let strtab = strtab_off(layout, 4);
        let mut buf = dynamic_fixture(
            layout,
            &[
                (DT_NEEDED, 0),
                (DT_STRTAB, strtab),
                (DT_NEEDED, 10),
                (DT_NULL, 0),
            ],
            b"libc.so.6\0libm.so.6\0",
        );
        // Cut after the first dynamic entry, before the terminator.
        let dyn_off = layout.ehdr_size() + 2 * layout.phdr_size();
        buf.truncate(dyn_off + layout.dyn_size());
        assert_eq!(deps_of(buf), Vec::<String>::new());
    }

    #[test]
    fn truncated_program_header_table_yields_nothing() {
        let layout = LAYOUTS[2];
        // Header promises four entries but the stream ends first.
        let mut buf = ehdr_bytes(layout, layout.ehdr_size() as u64, 4);
        buf.extend(phdr_bytes(layout, 1, 0));
        assert_eq!(deps_of(buf), Vec::<String>::new());
    }

    #[test]
    fn names_spanning_chunks_resolve() {
        let layout = LAYOUTS[2];
        let long = "a".repeat(STRTAB_CHUNK + 30);
        let mut strtab_bytes = long.clone().into_bytes();
        strtab_bytes.push(0);
        let strtab = strtab_off(layout, 3);
        let buf = dynamic_fixture(
            layout,
            &[(DT_NEEDED, 0), (DT_STRTAB, strtab), (DT_NULL, 0)],
            &strtab_bytes,
        );
        assert_eq!(deps_of(buf), vec![long]);
    }

    #[test]
    fn unterminated_name_stops_resolution() {
        let layout = LAYOUTS[2];
        let strtab = strtab_off(layout, 4);
        // Second name has no NUL before the stream ends.
        let buf = dynamic_fixture(
            layout,
            &[
                (DT_NEEDED, 0),
                (DT_NEEDED, 10),
                (DT_STRTAB, strtab),
                (DT_NULL, 0),
            ],
            b"libc.so.6\0libm.so.6",
        );
        assert_eq!(deps_of(buf), vec!["libc.so.6"]);
    }

    #[test]
    fn strtab_offset_of_zero_is_treated_as_missing() {
        let layout = LAYOUTS[2];
        let buf = dynamic_fixture(
            layout,
            &[(DT_NEEDED, 0), (DT_STRTAB, 0), (DT_NULL, 0)],
            b"libc.so.6\0",
        );
        assert_eq!(deps_of(buf), Vec::<String>::new());
    }

    #[test]
    fn rejects_wrong_magic_and_unknown_class() {
        let layout = LAYOUTS[2];
        let mut bad_magic = ehdr_bytes(layout, 0, 0);
        bad_magic[0] = 0x7E;
        let mut cur = Cursor::new(bad_magic);
        assert!(ElfObject::parse(&mut cur).unwrap().is_none());

        let mut bad_class = ehdr_bytes(layout, 0, 0);
        bad_class[EI_CLASS] = 3;
        let mut cur = Cursor::new(bad_class);
        assert!(ElfObject::parse(&mut cur).unwrap().is_none());

        let mut cur = Cursor::new(ELF_MAGIC.to_vec());
        assert!(ElfObject::parse(&mut cur).unwrap().is_none());
    }

    #[test]
    fn header_fields_decode_per_layout() {
        for layout in LAYOUTS {
            let buf = ehdr_bytes(layout, 0, 3);
            let mut cur = Cursor::new(buf);
            let elf = ElfObject::parse(&mut cur).unwrap().unwrap();
            assert_eq!(elf.class(), layout.class);
            assert_eq!(elf.endian(), layout.endian);
            assert_eq!(elf.header.e_type, 2);
            assert_eq!(elf.header.e_machine, 62);
            assert_eq!(elf.header.e_entry, 0x1000);
            assert_eq!(elf.header.e_phnum, 3);
        }
    }
}

//! Synthetic PE32 image builder.
//!
//! Test support: assembles well-formed PE32 files from scratch so parser
//! and loader tests do not depend on binary fixtures. Not used at runtime.

use crate::header::{DATA_DIRECTORY_COUNT, MACHINE_ARM};

/// File offset of the NT headers written by the builder.
const NT_OFFSET: u32 = 0x40;

/// Size of the PE32 optional header (96 bytes + 16 directories).
const OPTIONAL_HEADER_SIZE: u32 = 96 + DATA_DIRECTORY_COUNT as u32 * 8;

/// File offset of the section table.
const SECTION_TABLE_OFFSET: u32 = NT_OFFSET + 4 + 20 + OPTIONAL_HEADER_SIZE;

struct SectionSpec {
    name: [u8; 8],
    rva: u32,
    virtual_size: u32,
    raw: Vec<u8>,
}

/// Builder for a synthetic PE32 file.
pub struct TestPe {
    machine: u16,
    image_base: u32,
    entry_rva: u32,
    size_of_image: Option<u32>,
    sections: Vec<SectionSpec>,
    dirs: [(u32, u32); DATA_DIRECTORY_COUNT],
}

impl TestPe {
    /// Starts a new image with the given preferred base and entry RVA.
    pub fn new(image_base: u32, entry_rva: u32) -> Self {
        Self {
            machine: MACHINE_ARM,
            image_base,
            entry_rva,
            size_of_image: None,
            sections: Vec::new(),
            dirs: [(0, 0); DATA_DIRECTORY_COUNT],
        }
    }

    /// Overrides the COFF machine id.
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Overrides the computed `SizeOfImage`.
    pub fn size_of_image(mut self, size: u32) -> Self {
        self.size_of_image = Some(size);
        self
    }

    /// Adds a section. `virtual_size` may exceed `raw.len()` (zero tail).
    pub fn section(mut self, name: &[u8; 8], rva: u32, virtual_size: u32, raw: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            name: *name,
            rva,
            virtual_size,
            raw: raw.to_vec(),
        });
        self
    }

    /// Sets an arbitrary data directory slot.
    pub fn dir(mut self, idx: usize, rva: u32, size: u32) -> Self {
        self.dirs[idx] = (rva, size);
        self
    }

    /// Sets the base relocation directory.
    pub fn reloc_dir(self, rva: u32, size: u32) -> Self {
        self.dir(crate::header::DIR_BASERELOC, rva, size)
    }

    /// Sets the export directory.
    pub fn export_dir(self, rva: u32, size: u32) -> Self {
        self.dir(crate::header::DIR_EXPORT, rva, size)
    }

    /// Sets the import directory.
    pub fn import_dir(self, rva: u32, size: u32) -> Self {
        self.dir(crate::header::DIR_IMPORT, rva, size)
    }

    /// Assembles the file bytes.
    pub fn build(self) -> Vec<u8> {
        let nsec = self.sections.len() as u16;

        // Lay out raw data after the section table, 16-byte aligned.
        let mut raw_cursor = (SECTION_TABLE_OFFSET + nsec as u32 * 40 + 15) & !15;
        let mut raw_offsets = Vec::with_capacity(self.sections.len());
        for s in &self.sections {
            raw_offsets.push(if s.raw.is_empty() { 0 } else { raw_cursor });
            raw_cursor = (raw_cursor + s.raw.len() as u32 + 15) & !15;
        }

        let size_of_image = self.size_of_image.unwrap_or_else(|| {
            let end = self
                .sections
                .iter()
                .map(|s| s.rva + s.virtual_size.max(s.raw.len() as u32))
                .max()
                .unwrap_or(0x1000);
            (end + 0xFFF) & !0xFFF
        });

        let mut out = vec![0u8; raw_cursor as usize];

        let put16 = |out: &mut Vec<u8>, at: usize, v: u16| {
            out[at..at + 2].copy_from_slice(&v.to_le_bytes());
        };
        let put32 = |out: &mut Vec<u8>, at: usize, v: u32| {
            out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        };

        // DOS header.
        out[0] = b'M';
        out[1] = b'Z';
        put32(&mut out, 0x3C, NT_OFFSET);

        // NT signature + COFF file header.
        let nt = NT_OFFSET as usize;
        out[nt..nt + 4].copy_from_slice(b"PE\0\0");
        put16(&mut out, nt + 4, self.machine);
        put16(&mut out, nt + 6, nsec);
        put16(&mut out, nt + 20, OPTIONAL_HEADER_SIZE as u16);
        put16(&mut out, nt + 22, 0x0102); // EXECUTABLE_IMAGE | 32BIT_MACHINE

        // Optional header.
        let opt = nt + 24;
        put16(&mut out, opt, 0x010B);
        put32(&mut out, opt + 16, self.entry_rva);
        put32(&mut out, opt + 28, self.image_base);
        put32(&mut out, opt + 32, 0x1000); // SectionAlignment
        put32(&mut out, opt + 36, 0x10); // FileAlignment
        put32(&mut out, opt + 56, size_of_image);
        put32(&mut out, opt + 60, SECTION_TABLE_OFFSET); // SizeOfHeaders
        put32(&mut out, opt + 92, DATA_DIRECTORY_COUNT as u32);
        for (i, (rva, size)) in self.dirs.iter().enumerate() {
            put32(&mut out, opt + 96 + i * 8, *rva);
            put32(&mut out, opt + 96 + i * 8 + 4, *size);
        }

        // Section table + raw data.
        for (i, s) in self.sections.iter().enumerate() {
            let at = SECTION_TABLE_OFFSET as usize + i * 40;
            out[at..at + 8].copy_from_slice(&s.name);
            put32(&mut out, at + 8, s.virtual_size);
            put32(&mut out, at + 12, s.rva);
            put32(&mut out, at + 16, s.raw.len() as u32);
            put32(&mut out, at + 20, raw_offsets[i]);

            let raw_at = raw_offsets[i] as usize;
            out[raw_at..raw_at + s.raw.len()].copy_from_slice(&s.raw);
        }

        out
    }
}

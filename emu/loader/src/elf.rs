//! ELF32 fallback loading: plain segment copy.

use std::path::Path;

use goblin::elf::{header::EM_ARM, program_header::PT_LOAD, Elf};
use log::debug;
use muon_core::GuestAddr;
use muon_mm::{MemProt, MemoryManager};

use crate::registry::{ImageId, LoadedImage, ModuleRegistry};
use crate::{module_key, LoadError};

/// Attempts to load `buf` as a 32-bit ARM ELF.
///
/// Returns `Ok(None)` if the buffer is not ELF at all (the caller then
/// tries PE); an ELF of the wrong class or machine is an error rather than
/// a fallthrough.
pub(crate) fn try_load_elf(
    mm: &mut MemoryManager,
    registry: &mut ModuleRegistry,
    buf: &[u8],
    path: &Path,
) -> Result<Option<ImageId>, LoadError> {
    let Ok(elf) = Elf::parse(buf) else {
        return Ok(None);
    };
    if elf.is_64 {
        return Err(LoadError::ElfNot32Bit);
    }
    if elf.header.e_machine != EM_ARM {
        return Err(LoadError::ElfNotArm(elf.header.e_machine));
    }

    let mut sections = Vec::new();
    let mut low = u32::MAX;
    let mut high = 0u32;
    for ph in elf.program_headers.iter().filter(|p| p.p_type == PT_LOAD) {
        let vaddr = GuestAddr::new(ph.p_vaddr as u32);
        let memsz = ph.p_memsz as u32;
        if memsz == 0 {
            continue;
        }
        debug!(
            "ELF segment: vaddr={vaddr} memsz={memsz:#x} filesz={:#x}",
            ph.p_filesz
        );
        mm.static_alloc(vaddr, memsz, MemProt::ALL)?;
        let file_range = ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize;
        mm.write_bytes(vaddr, &buf[file_range])?;
        sections.push((vaddr, memsz));
        low = low.min(vaddr.as_u32());
        high = high.max(vaddr.as_u32().saturating_add(memsz));
    }

    let base = GuestAddr::new(if low == u32::MAX { 0 } else { low });
    let image = LoadedImage {
        name: module_key(path),
        path: path.to_path_buf(),
        preferred_base: base,
        actual_base: base,
        size_of_image: high.saturating_sub(base.as_u32()),
        entry: GuestAddr::new(elf.entry as u32),
        sections,
        exports_by_name: Default::default(),
        exports_by_ordinal: Default::default(),
    };
    Ok(Some(registry.register(image)))
}

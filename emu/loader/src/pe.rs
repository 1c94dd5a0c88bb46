//! PE32 mapping, relocation, export parsing and import resolution.

use std::path::Path;

use log::{debug, info, warn};
use muon_core::{page_align_up, GuestAddr};
use muon_mm::{MemError, MemProt, MemoryManager, SCAN_BASE, SCAN_END, SCAN_STEP};
use muon_pe::export::EXPORT_DIRECTORY_SIZE;
use muon_pe::header::{DIR_BASERELOC, DIR_EXPORT, DIR_IMPORT, MACHINE_ARM, MACHINE_THUMB};
use muon_pe::import::{Thunk, IMPORT_DESCRIPTOR_SIZE};
use muon_pe::reloc::RELOC_BLOCK_HEADER_SIZE;
use muon_pe::{
    DataDirectory, ExportDirectory, ImportDescriptor, Pe32, RelocBlockHeader, RelocEntry,
    RelocKind, SectionHeader,
};

use crate::registry::{ImageId, LoadedImage, ModuleRegistry};
use crate::{module_key, module_key_str, LoadError};

/// Thumb return-zero stub: `movs r0, #0 ; bx lr`.
const THUMB_RETURN_ZERO: [u8; 4] = [0x00, 0x20, 0x70, 0x47];

/// Longest dependency name / import name the resolver will read.
const MAX_NAME: u32 = 512;

/// Maps `buf` as a PE32 image and resolves its imports, recursing into
/// `system_dir` for dependencies. Re-loading an already registered module
/// returns the existing id.
pub(crate) fn load_pe(
    mm: &mut MemoryManager,
    registry: &mut ModuleRegistry,
    buf: &[u8],
    path: &Path,
    system_dir: &Path,
) -> Result<ImageId, LoadError> {
    let key = module_key(path);
    if let Some(Some(id)) = registry.lookup(&key) {
        debug!("module {key} already loaded");
        return Ok(id);
    }

    let pe = Pe32::parse(buf)?;
    if pe.machine != MACHINE_ARM && pe.machine != MACHINE_THUMB {
        warn!("{key}: unexpected machine {:#06x}, loading anyway", pe.machine);
    }

    let sections: Vec<SectionHeader> = pe.sections().collect();
    let preferred = GuestAddr::new(pe.image_base);

    // Map at the preferred base, or hunt for one that fits.
    let (actual, mapped) = match try_map_at(mm, preferred, &sections, buf) {
        Ok(mapped) => (preferred, mapped),
        Err(LoadError::Mem(MemError::AlreadyMapped { .. })) => {
            rebase(mm, &sections, buf)?
        }
        Err(e) => return Err(e),
    };

    let delta = i64::from(actual.as_u32()) - i64::from(preferred.as_u32());
    if delta != 0 {
        info!("{key}: rebased {preferred} -> {actual}");
        apply_relocations(mm, pe.data_directory(DIR_BASERELOC), actual, delta)?;
    }

    let mut image = LoadedImage {
        name: key,
        path: path.to_path_buf(),
        preferred_base: preferred,
        actual_base: actual,
        size_of_image: pe.size_of_image,
        entry: actual + pe.entry_rva,
        sections: mapped,
        exports_by_name: Default::default(),
        exports_by_ordinal: Default::default(),
    };
    parse_exports(mm, pe.data_directory(DIR_EXPORT), actual, &mut image)?;

    // Register before resolving imports so dependency cycles find us (they
    // may read our exports, which are complete by now — never our IAT).
    let import_dir = pe.data_directory(DIR_IMPORT);
    let id = registry.register(image);
    resolve_imports(mm, registry, actual, import_dir, system_dir)?;
    Ok(id)
}

/// Maps every section at `base + rva`, copying raw data (the zero tail
/// comes free with the fresh block). Rolls the partial mapping back on
/// failure.
fn try_map_at(
    mm: &mut MemoryManager,
    base: GuestAddr,
    sections: &[SectionHeader],
    file: &[u8],
) -> Result<Vec<(GuestAddr, u32)>, LoadError> {
    fn rollback(mm: &mut MemoryManager, mapped: &[(GuestAddr, u32)]) {
        for &(at, _) in mapped {
            let _ = mm.static_free(at);
        }
    }

    let mut mapped: Vec<(GuestAddr, u32)> = Vec::new();
    for s in sections {
        let msize = s.mapped_size();
        if msize == 0 {
            continue;
        }
        let at = base + s.virtual_address;
        if let Err(e) = mm.static_alloc(at, msize, MemProt::ALL) {
            rollback(mm, &mapped);
            return Err(e.into());
        }
        mapped.push((at, msize));

        if s.size_of_raw_data > 0 {
            let lo = s.pointer_to_raw_data as usize;
            let hi = lo + s.size_of_raw_data as usize;
            if hi > file.len() {
                rollback(mm, &mapped);
                return Err(muon_pe::PeError::Truncated.into());
            }
            if let Err(e) = mm.write_bytes(at, &file[lo..hi]) {
                rollback(mm, &mapped);
                return Err(e.into());
            }
        }
    }
    Ok(mapped)
}

/// Walks the candidate range at 1 MiB strides for a base where every
/// section can be mapped simultaneously, and maps there.
fn rebase(
    mm: &mut MemoryManager,
    sections: &[SectionHeader],
    file: &[u8],
) -> Result<(GuestAddr, Vec<(GuestAddr, u32)>), LoadError> {
    let mut candidate = SCAN_BASE;
    while candidate < SCAN_END {
        let fits = sections.iter().all(|s| {
            let msize = s.mapped_size();
            msize == 0
                || page_align_up(msize)
                    .is_some_and(|r| mm.range_is_free(candidate + s.virtual_address, r))
        });
        if fits {
            match try_map_at(mm, candidate, sections, file) {
                Ok(mapped) => return Ok((candidate, mapped)),
                // Sections of this image collide with each other here;
                // a different base will not help for AlreadyMapped within
                // the image, but the probe is cheap, keep scanning.
                Err(LoadError::Mem(MemError::AlreadyMapped { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        candidate = candidate + SCAN_STEP;
    }
    Err(LoadError::NoBaseFits)
}

/// Applies `HIGHLOW` fixups: every recorded 32-bit word moves by `delta`.
fn apply_relocations(
    mm: &mut MemoryManager,
    dir: DataDirectory,
    actual_base: GuestAddr,
    delta: i64,
) -> Result<(), LoadError> {
    if !dir.is_present() {
        return Ok(());
    }
    let mut cur = 0u32;
    while cur + (RELOC_BLOCK_HEADER_SIZE as u32) <= dir.size {
        let block_at = actual_base + dir.virtual_address + cur;
        let mut hdr_raw = [0u8; RELOC_BLOCK_HEADER_SIZE];
        mm.read_bytes(block_at, &mut hdr_raw)?;
        let hdr = RelocBlockHeader::parse(&hdr_raw)?;

        for i in 0..hdr.entry_count() {
            let raw = mm.read_u16(block_at + 8 + i as u32 * 2)?;
            let entry = RelocEntry::from_raw(raw);
            match entry.kind {
                RelocKind::HighLow => {
                    let at = actual_base + hdr.page_rva + u32::from(entry.offset);
                    let orig = mm.read_u32(at)?;
                    mm.write_u32(at, (i64::from(orig) + delta) as u32)?;
                }
                RelocKind::Absolute => {}
                RelocKind::Other(t) => {
                    warn!("unexpected relocation type {t} at block rva {:#x}", hdr.page_rva);
                }
            }
        }
        cur += hdr.block_size;
    }
    Ok(())
}

/// Fills the image's export maps from its export directory.
fn parse_exports(
    mm: &MemoryManager,
    dir: DataDirectory,
    actual_base: GuestAddr,
    image: &mut LoadedImage,
) -> Result<(), LoadError> {
    if !dir.is_present() {
        return Ok(());
    }
    let mut raw = [0u8; EXPORT_DIRECTORY_SIZE];
    mm.read_bytes(actual_base + dir.virtual_address, &mut raw)?;
    let ed = ExportDirectory::parse(&raw)?;

    for i in 0..ed.number_of_functions {
        let func_rva = mm.read_u32(actual_base + ed.address_of_functions + i * 4)?;
        image
            .exports_by_ordinal
            .insert(ed.ordinal_base + i, (actual_base + func_rva).as_u32());
    }
    for k in 0..ed.number_of_names {
        let name_rva = mm.read_u32(actual_base + ed.address_of_names + k * 4)?;
        let name = mm.read_cstr(actual_base + name_rva, MAX_NAME)?;
        let ord_index = mm.read_u16(actual_base + ed.address_of_name_ordinals + k * 2)?;
        let func_rva =
            mm.read_u32(actual_base + ed.address_of_functions + u32::from(ord_index) * 4)?;
        image
            .exports_by_name
            .insert(name, (actual_base + func_rva).as_u32());
    }
    debug!(
        "{}: {} exports ({} named)",
        image.name,
        image.exports_by_ordinal.len(),
        image.exports_by_name.len()
    );
    Ok(())
}

/// Resolves every import descriptor of the image based at `actual_base`,
/// loading dependencies from `system_dir` as needed. Unresolved imports
/// get a Thumb return-zero stub with the Thumb bit set in the IAT slot.
fn resolve_imports(
    mm: &mut MemoryManager,
    registry: &mut ModuleRegistry,
    actual_base: GuestAddr,
    dir: DataDirectory,
    system_dir: &Path,
) -> Result<(), LoadError> {
    if !dir.is_present() {
        return Ok(());
    }

    let mut desc_at = actual_base + dir.virtual_address;
    loop {
        let mut raw = [0u8; IMPORT_DESCRIPTOR_SIZE];
        mm.read_bytes(desc_at, &mut raw)?;
        let desc = ImportDescriptor::parse(&raw)?;
        if desc.is_null() {
            break;
        }

        let raw_name = mm.read_cstr(actual_base + desc.name, MAX_NAME)?;
        let dep_key = module_key_str(&raw_name);
        let dep = resolve_dependency(mm, registry, &dep_key, system_dir)?;

        let mut iat_at = actual_base + desc.first_thunk;
        let mut lookup_at = actual_base + desc.lookup_thunk();
        loop {
            let Some(thunk) = Thunk::from_raw(mm.read_u32(lookup_at)?) else {
                break;
            };
            let resolved = match thunk {
                Thunk::Ordinal(ord) => dep
                    .and_then(|id| registry.image(id).exports_by_ordinal.get(&ord).copied()),
                Thunk::ByName(rva) => {
                    // Skip the 2-byte hint of IMAGE_IMPORT_BY_NAME.
                    let name = mm.read_cstr(actual_base + rva + 2, MAX_NAME)?;
                    dep.and_then(|id| registry.image(id).exports_by_name.get(&name).copied())
                }
            };
            let value = match resolved {
                Some(v) => v,
                None => {
                    let stub = registry.alloc_stub(mm, &THUMB_RETURN_ZERO)?;
                    info!("stubbed {dep_key} import (thunk {thunk:?}) -> {stub}");
                    stub.as_u32() | 1
                }
            };
            mm.write_u32(iat_at, value)?;
            iat_at = iat_at + 4;
            lookup_at = lookup_at + 4;
        }

        desc_at = desc_at + IMPORT_DESCRIPTOR_SIZE as u32;
    }
    Ok(())
}

/// Finds or loads the dependency module `key`. `Ok(None)` means the file
/// is missing and every import from it must be stubbed.
fn resolve_dependency(
    mm: &mut MemoryManager,
    registry: &mut ModuleRegistry,
    key: &str,
    system_dir: &Path,
) -> Result<Option<ImageId>, LoadError> {
    if let Some(slot) = registry.lookup(key) {
        // Either loaded (perhaps still resolving higher up the stack) or
        // already known to be missing.
        return Ok(slot);
    }
    let dep_path = system_dir.join(key);
    match std::fs::read(&dep_path) {
        Ok(dep_buf) => Ok(Some(load_pe(mm, registry, &dep_buf, &dep_path, system_dir)?)),
        Err(_) => {
            warn!("dependency {key} not found in {}", system_dir.display());
            registry.register_missing(key.to_string());
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use muon_pe::test_image::TestPe;

    fn put32(out: &mut Vec<u8>, at: usize, v: u32) {
        out[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put16(out: &mut Vec<u8>, at: usize, v: u16) {
        out[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Builds an `.edata` payload exporting `funcs` (name, function RVA),
    /// with ordinal base 1 and ordinals in declaration order.
    fn edata_bytes(edata_rva: u32, funcs: &[(&str, u32)]) -> Vec<u8> {
        let n = funcs.len() as u32;
        let aof = edata_rva + 40;
        let aon = aof + 4 * n;
        let aoo = aon + 4 * n;
        let names_start = aoo + 2 * n;

        let mut name_rvas = Vec::new();
        let mut names_blob = Vec::new();
        for (name, _) in funcs {
            name_rvas.push(names_start + names_blob.len() as u32);
            names_blob.extend_from_slice(name.as_bytes());
            names_blob.push(0);
        }

        let total = (names_start - edata_rva) as usize + names_blob.len();
        let mut out = vec![0u8; total];
        put32(&mut out, 16, 1); // ordinal base
        put32(&mut out, 20, n);
        put32(&mut out, 24, n);
        put32(&mut out, 28, aof);
        put32(&mut out, 32, aon);
        put32(&mut out, 36, aoo);
        for (i, (_, func_rva)) in funcs.iter().enumerate() {
            put32(&mut out, 40 + i * 4, *func_rva);
        }
        for (i, rva) in name_rvas.iter().enumerate() {
            put32(&mut out, (aon - edata_rva) as usize + i * 4, *rva);
        }
        for i in 0..funcs.len() {
            put16(&mut out, (aoo - edata_rva) as usize + i * 2, i as u16);
        }
        let blob_at = (names_start - edata_rva) as usize;
        out[blob_at..].copy_from_slice(&names_blob);
        out
    }

    /// One imported symbol.
    #[derive(Clone, Copy)]
    enum Sym<'a> {
        Name(&'a str),
        Ord(u32),
    }

    /// Builds an `.idata` payload importing `imports` (dll name, symbols).
    /// Returns the payload and the RVA of every IAT slot, in order.
    fn idata_bytes(idata_rva: u32, imports: &[(&str, &[Sym<'_>])]) -> (Vec<u8>, Vec<u32>) {
        let ndesc = imports.len() as u32;
        let mut cursor = idata_rva + (ndesc + 1) * 20;

        // Per-import layout: lookup array, IAT array, dll name, hint/name
        // entries for by-name symbols.
        struct Layout {
            lookup_rva: u32,
            iat_rva: u32,
            dll_rva: u32,
            thunks: Vec<u32>,
        }
        let mut layouts = Vec::new();

        for (dll, syms) in imports {
            let k = syms.len() as u32;
            let lookup_rva = cursor;
            cursor += (k + 1) * 4;
            let iat_rva = cursor;
            cursor += (k + 1) * 4;
            let dll_rva = cursor;
            cursor += dll.len() as u32 + 1;
            cursor = (cursor + 1) & !1;

            let mut thunks = Vec::new();
            for sym in *syms {
                match sym {
                    Sym::Ord(o) => thunks.push(0x8000_0000 | o),
                    Sym::Name(n) => {
                        thunks.push(cursor);
                        cursor += 2 + n.len() as u32 + 1;
                        cursor = (cursor + 1) & !1;
                    }
                }
            }
            layouts.push(Layout {
                lookup_rva,
                iat_rva,
                dll_rva,
                thunks,
            });
        }

        let total = (cursor - idata_rva) as usize;
        let mut out = vec![0u8; total];
        let mut iat_slots = Vec::new();

        for (i, ((dll, syms), layout)) in imports.iter().zip(&layouts).enumerate() {
            // Descriptor.
            let d = i * 20;
            put32(&mut out, d, layout.lookup_rva);
            put32(&mut out, d + 12, layout.dll_rva);
            put32(&mut out, d + 16, layout.iat_rva);

            // Thunk arrays (lookup and IAT start out identical).
            for (j, &t) in layout.thunks.iter().enumerate() {
                put32(&mut out, (layout.lookup_rva - idata_rva) as usize + j * 4, t);
                put32(&mut out, (layout.iat_rva - idata_rva) as usize + j * 4, t);
                iat_slots.push(layout.iat_rva + j as u32 * 4);
            }

            // Dependency name.
            let at = (layout.dll_rva - idata_rva) as usize;
            out[at..at + dll.len()].copy_from_slice(dll.as_bytes());

            // Hint/name entries.
            for (sym, &t) in syms.iter().zip(&layout.thunks) {
                if let Sym::Name(n) = sym {
                    let at = (t - idata_rva) as usize + 2;
                    out[at..at + n.len()].copy_from_slice(n.as_bytes());
                }
            }
        }
        (out, iat_slots)
    }

    /// A DLL exporting `funcs` out of a 0x100-byte `.text` at RVA 0x1000.
    fn build_export_dll(base: u32, funcs: &[(&str, u32)]) -> Vec<u8> {
        let edata = edata_bytes(0x2000, funcs);
        let len = edata.len() as u32;
        TestPe::new(base, 0x1000)
            .section(b".text\0\0\0", 0x1000, 0x100, &[0xEE; 0x100])
            .section(b".edata\0\0", 0x2000, len, &edata)
            .export_dir(0x2000, len)
            .build()
    }

    #[test]
    fn preferred_base_load_has_no_relocation_effects() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let base = 0x1840_0000;

        // .text carries an absolute pointer at +0x10, with a HIGHLOW entry.
        let mut text = vec![0u8; 0x40];
        put32(&mut text, 0x10, base + 0x1234);
        let mut reloc = vec![0u8; 12];
        put32(&mut reloc, 0, 0x1000); // page RVA
        put32(&mut reloc, 4, 12); // block size
        put16(&mut reloc, 8, 0x3010); // HIGHLOW at +0x10
        let file = TestPe::new(base, 0x1004)
            .section(b".text\0\0\0", 0x1000, 0x40, &text)
            .section(b".reloc\0\0", 0x4000, 12, &reloc)
            .reloc_dir(0x4000, 12)
            .build();

        let tmp = tempfile::tempdir().unwrap();
        let id = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("app.exe"), tmp.path()).unwrap();

        let img = reg.image(id);
        assert_eq!(img.actual_base.as_u32(), base);
        assert_eq!(img.entry.as_u32(), base + 0x1004);
        // No delta: the word is untouched.
        assert_eq!(
            mm.read_u32(GuestAddr::new(base + 0x1010)).unwrap(),
            base + 0x1234
        );
        // Raw tail beyond SizeOfRawData is zero.
        assert_eq!(mm.read_u32(GuestAddr::new(base + 0x1040)).unwrap(), 0);
    }

    #[test]
    fn rebase_shifts_every_highlow_word() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let base = 0x1840_0000;

        let mut text = vec![0u8; 0x40];
        put32(&mut text, 0x10, base + 0x1234);
        put32(&mut text, 0x20, base + 0x2008);
        let mut reloc = vec![0u8; 16];
        put32(&mut reloc, 0, 0x1000);
        put32(&mut reloc, 4, 16);
        put16(&mut reloc, 8, 0x3010);
        put16(&mut reloc, 10, 0x3020);
        put16(&mut reloc, 12, 0x0000); // ABSOLUTE padding
        let file = TestPe::new(base, 0x1004)
            .section(b".text\0\0\0", 0x1000, 0x40, &text)
            .section(b".reloc\0\0", 0x4000, 16, &reloc)
            .reloc_dir(0x4000, 16)
            .build();

        // Occupy the preferred range so the image must move.
        mm.static_alloc(GuestAddr::new(base + 0x1000), 0x1000, MemProt::ALL)
            .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let id = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("app.exe"), tmp.path()).unwrap();

        let img = reg.image(id);
        let actual = img.actual_base.as_u32();
        assert_ne!(actual, base);
        let delta = actual.wrapping_sub(base);
        assert_eq!(img.entry.as_u32(), actual + 0x1004);
        assert_eq!(
            mm.read_u32(GuestAddr::new(actual + 0x1010)).unwrap(),
            (base + 0x1234).wrapping_add(delta)
        );
        assert_eq!(
            mm.read_u32(GuestAddr::new(actual + 0x1020)).unwrap(),
            (base + 0x2008).wrapping_add(delta)
        );
    }

    #[test]
    fn exports_are_collected_by_name_and_ordinal() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let base = 0x1850_0000;
        let file = build_export_dll(base, &[("alpha", 0x1000), ("beta", 0x1010)]);

        let tmp = tempfile::tempdir().unwrap();
        let id = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("dep.dll"), tmp.path()).unwrap();

        let img = reg.image(id);
        assert_eq!(img.exports_by_name["alpha"], base + 0x1000);
        assert_eq!(img.exports_by_name["beta"], base + 0x1010);
        assert_eq!(img.exports_by_ordinal[&1], base + 0x1000);
        assert_eq!(img.exports_by_ordinal[&2], base + 0x1010);
    }

    #[test]
    fn imports_resolve_by_name_and_ordinal() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();

        let dep_base = 0x1850_0000;
        std::fs::write(
            tmp.path().join("dep.dll"),
            build_export_dll(dep_base, &[("alpha", 0x1000), ("beta", 0x1010)]),
        )
        .unwrap();

        let exe_base = 0x1860_0000;
        let (idata, iat_slots) = idata_bytes(
            0x3000,
            &[("dep.dll", &[Sym::Name("alpha"), Sym::Ord(2)][..])],
        );
        let ilen = idata.len() as u32;
        let file = TestPe::new(exe_base, 0x1000)
            .section(b".text\0\0\0", 0x1000, 0x20, &[0xAA; 0x20])
            .section(b".idata\0\0", 0x3000, ilen, &idata)
            .import_dir(0x3000, 40)
            .build();

        let id = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("app.exe"), tmp.path()).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.image(id).name, "app.exe");

        assert_eq!(
            mm.read_u32(GuestAddr::new(exe_base + iat_slots[0])).unwrap(),
            dep_base + 0x1000
        );
        assert_eq!(
            mm.read_u32(GuestAddr::new(exe_base + iat_slots[1])).unwrap(),
            dep_base + 0x1010
        );
    }

    #[test]
    fn missing_dependency_becomes_thumb_stub() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();

        let exe_base = 0x1860_0000;
        let (idata, iat_slots) =
            idata_bytes(0x3000, &[("missing.dll", &[Sym::Name("foo")][..])]);
        let ilen = idata.len() as u32;
        let file = TestPe::new(exe_base, 0x1000)
            .section(b".text\0\0\0", 0x1000, 0x20, &[0xAA; 0x20])
            .section(b".idata\0\0", 0x3000, ilen, &idata)
            .import_dir(0x3000, 40)
            .build();

        let _ = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("app.exe"), tmp.path()).unwrap();

        let slot = mm.read_u32(GuestAddr::new(exe_base + iat_slots[0])).unwrap();
        // Thumb bit set; the stub body is `movs r0,#0 ; bx lr`.
        assert_eq!(slot & 1, 1);
        let mut body = [0u8; 4];
        mm.read_bytes(GuestAddr::new(slot & !1), &mut body).unwrap();
        assert_eq!(body, THUMB_RETURN_ZERO);
        // Only the root image is registered; the missing name is remembered.
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup("missing.dll"), Some(None));
    }

    #[test]
    fn import_cycle_loads_each_module_once() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();

        // a.dll exports funca and imports b.dll!funcb; b.dll the reverse.
        let a_base = 0x1850_0000;
        let b_base = 0x1870_0000;

        let build_cyclic = |base: u32, export: &str, dep: &str, import: &str| {
            let edata = edata_bytes(0x2000, &[(export, 0x1000)]);
            let elen = edata.len() as u32;
            let (idata, iat_slots) = idata_bytes(0x3000, &[(dep, &[Sym::Name(import)][..])]);
            let ilen = idata.len() as u32;
            let file = TestPe::new(base, 0x1000)
                .section(b".text\0\0\0", 0x1000, 0x100, &[0xEE; 0x100])
                .section(b".edata\0\0", 0x2000, elen, &edata)
                .section(b".idata\0\0", 0x3000, ilen, &idata)
                .export_dir(0x2000, elen)
                .import_dir(0x3000, 40)
                .build();
            (file, iat_slots)
        };

        let (a_file, a_iat) = build_cyclic(a_base, "funca", "b.dll", "funcb");
        let (b_file, b_iat) = build_cyclic(b_base, "funcb", "a.dll", "funca");
        std::fs::write(tmp.path().join("b.dll"), &b_file).unwrap();

        let a_id = load_pe(&mut mm, &mut reg, &a_file, &tmp.path().join("a.dll"), tmp.path()).unwrap();

        // Exactly two images, no duplicate of a.dll.
        assert_eq!(reg.len(), 2);
        let b_id = reg.lookup("b.dll").unwrap().unwrap();
        assert_ne!(a_id, b_id);

        // Each IAT points at the other's export.
        assert_eq!(
            mm.read_u32(GuestAddr::new(a_base + a_iat[0])).unwrap(),
            b_base + 0x1000
        );
        assert_eq!(
            mm.read_u32(GuestAddr::new(b_base + b_iat[0])).unwrap(),
            a_base + 0x1000
        );
    }

    #[test]
    fn double_load_returns_existing_image() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let file = build_export_dll(0x1850_0000, &[("alpha", 0x1000)]);

        let id1 = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("dep.dll"), tmp.path()).unwrap();
        let id2 = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("DEP.DLL"), tmp.path()).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn truncated_raw_data_is_a_hard_error() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();

        let mut file = TestPe::new(0x1840_0000, 0x1000)
            .section(b".text\0\0\0", 0x1000, 0x40, &[0xAA; 0x40])
            .build();
        // Chop the raw data off the end of the file.
        file.truncate(file.len() - 0x20);

        let err = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("app.exe"), tmp.path());
        assert!(matches!(err, Err(LoadError::Pe(muon_pe::PeError::Truncated))));
        // Nothing stays mapped behind a failed load.
        assert!(mm.range_is_free(GuestAddr::new(0x1840_1000), 0x1000));
    }

    #[test]
    fn handle_lookup_finds_image_by_base() {
        let mut mm = MemoryManager::new();
        let mut reg = ModuleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let base = 0x1850_0000;
        let file = build_export_dll(base, &[("alpha", 0x1000)]);
        let id = load_pe(&mut mm, &mut reg, &file, &tmp.path().join("dep.dll"), tmp.path()).unwrap();

        assert_eq!(reg.by_handle(GuestAddr::new(base)), Some(id));
        assert_eq!(reg.by_handle(GuestAddr::new(base + 4)), None);
        assert!(reg.image(id).contains(GuestAddr::new(base + 0x1000)));
    }
}

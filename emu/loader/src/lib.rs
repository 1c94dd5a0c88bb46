//! Guest image loading.
//!
//! Accepts either a 32-bit ARM ELF (plain segment copy, entry point
//! honoured) or a PE32 image: sections mapped at the preferred base or a
//! rebased one, base relocations applied, exports collected, and imports
//! resolved against a registry of loaded modules — recursively loading
//! dependencies from a nominated system directory, tolerating import
//! cycles, and synthesising Thumb return-zero stubs for anything that
//! stays unresolved.

mod elf;
mod pe;
mod registry;

use std::fmt;
use std::io;
use std::path::Path;

use log::info;
use muon_core::GuestAddr;
use muon_mm::{MemError, MemProt, MemoryManager};
use muon_pe::PeError;

pub use registry::{ImageId, LoadedImage, ModuleRegistry};

/// Guest base address of the kernel ROM blob.
pub const ROM_BASE: GuestAddr = GuestAddr::new(0x3000_0000);

/// Loader errors.
#[derive(Debug)]
pub enum LoadError {
    /// Reading an image file failed.
    Io(io::Error),
    /// PE parsing failed.
    Pe(PeError),
    /// The file is ELF but not 32-bit.
    ElfNot32Bit,
    /// The file is ELF but not an ARM image.
    ElfNotArm(u16),
    /// Memory manager failure while placing an image.
    Mem(MemError),
    /// No candidate base could host every section simultaneously.
    NoBaseFits,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "image read failed: {e}"),
            Self::Pe(e) => write!(f, "PE parse failed: {e}"),
            Self::ElfNot32Bit => write!(f, "ELF image is not 32-bit"),
            Self::ElfNotArm(m) => write!(f, "ELF machine {m:#x} is not ARM"),
            Self::Mem(e) => write!(f, "mapping failed: {e}"),
            Self::NoBaseFits => write!(f, "no load base fits every section"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PeError> for LoadError {
    fn from(e: PeError) -> Self {
        Self::Pe(e)
    }
}

impl From<MemError> for LoadError {
    fn from(e: MemError) -> Self {
        Self::Mem(e)
    }
}

/// Loads the guest executable at `path`, trying ELF32 first and falling
/// back to PE32 with import resolution rooted at `system_dir`.
///
/// Returns the id of the root image in `registry`.
pub fn load_executable(
    mm: &mut MemoryManager,
    registry: &mut ModuleRegistry,
    path: &Path,
    system_dir: &Path,
) -> Result<ImageId, LoadError> {
    let buf = std::fs::read(path)?;
    if let Some(result) = elf::try_load_elf(mm, registry, &buf, path)? {
        info!("loaded ELF image {} entry={}", path.display(), registry.image(result).entry);
        return Ok(result);
    }
    let id = pe::load_pe(mm, registry, &buf, path, system_dir)?;
    info!(
        "loaded PE image {} base={} entry={}",
        path.display(),
        registry.image(id).actual_base,
        registry.image(id).entry
    );
    Ok(id)
}

/// Loads the kernel ROM blob verbatim at [`ROM_BASE`]. Returns its size.
pub fn load_rom(mm: &mut MemoryManager, path: &Path) -> Result<u32, LoadError> {
    let buf = std::fs::read(path)?;
    let size = buf.len() as u32;
    mm.static_alloc(ROM_BASE, size, MemProt::READ | MemProt::EXEC)?;
    mm.write_bytes(ROM_BASE, &buf)?;
    info!("loaded kernel ROM {} ({size} bytes)", path.display());
    Ok(size)
}

/// Lower-cased final path component, the registry key for a module.
pub(crate) fn module_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Same, for names that arrive from import descriptors and may carry
/// either separator style.
pub(crate) fn module_key_str(raw: &str) -> String {
    let lower = raw.to_lowercase();
    lower
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(&lower)
        .to_string()
}

//! The loaded-modules registry.

use std::collections::HashMap;
use std::path::PathBuf;

use muon_core::{GuestAddr, PAGE_SIZE};
use muon_mm::{MemError, MemProt, MemoryManager};

/// Index of an image inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub(crate) usize);

/// A mapped guest image.
#[derive(Debug)]
pub struct LoadedImage {
    /// Registry key: lower-cased base filename.
    pub name: String,
    /// Source path on the host.
    pub path: PathBuf,
    /// The base the headers asked for.
    pub preferred_base: GuestAddr,
    /// The base the image actually got.
    pub actual_base: GuestAddr,
    /// `SizeOfImage` (PE) or the mapped span (ELF).
    pub size_of_image: u32,
    /// Absolute entry point (Thumb bit per the image).
    pub entry: GuestAddr,
    /// Mapped section ranges `(guest base, size)`.
    pub sections: Vec<(GuestAddr, u32)>,
    /// Named exports: name → absolute guest address.
    pub exports_by_name: HashMap<String, u32>,
    /// Ordinal exports: ordinal → absolute guest address.
    pub exports_by_ordinal: HashMap<u32, u32>,
}

impl LoadedImage {
    /// Returns `true` if `addr` falls inside one of this image's sections.
    pub fn contains(&self, addr: GuestAddr) -> bool {
        self.sections
            .iter()
            .any(|&(base, size)| addr >= base && addr.as_u32() < base.as_u32().wrapping_add(size))
    }
}

/// Bump allocator for synthesised import stubs.
///
/// Unresolved imports each get a tiny Thumb stub; allocating a fresh page
/// per stub would burn a 1 MiB scan stride each time, so stubs are packed
/// into shared pages handed out bump-style.
#[derive(Debug, Default)]
struct StubPool {
    page: Option<GuestAddr>,
    used: u32,
}

impl StubPool {
    fn alloc(&mut self, mm: &mut MemoryManager, bytes: &[u8]) -> Result<GuestAddr, MemError> {
        let len = bytes.len() as u32;
        let page = match self.page {
            Some(p) if self.used + len <= PAGE_SIZE => p,
            _ => {
                let p = mm.static_alloc_anywhere(PAGE_SIZE, MemProt::READ | MemProt::EXEC)?;
                self.page = Some(p);
                self.used = 0;
                p
            }
        };
        let addr = page + self.used;
        mm.write_bytes(addr, bytes)?;
        self.used += len;
        Ok(addr)
    }
}

/// All loaded modules, keyed by lower-cased base filename.
///
/// A module is registered — exports complete — *before* its own imports
/// resolve, which is what lets dependency cycles terminate: a dependent
/// deeper in the recursion finds the half-resolved module here and reads
/// only its exports, never its IAT. A name mapped to `None` records a
/// dependency whose file was missing, so later importers take the stub
/// path without re-probing the file system.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    images: Vec<LoadedImage>,
    by_name: HashMap<String, Option<ImageId>>,
    stubs: StubPool,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the image for `id`.
    pub fn image(&self, id: ImageId) -> &LoadedImage {
        &self.images[id.0]
    }

    /// Number of loaded images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Returns `true` when nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Iterates all loaded images.
    pub fn iter(&self) -> impl Iterator<Item = (ImageId, &LoadedImage)> {
        self.images.iter().enumerate().map(|(i, img)| (ImageId(i), img))
    }

    /// Looks a module up by registry key. The outer `Option` is "have we
    /// seen this name"; the inner one is `None` for a known-missing module.
    pub fn lookup(&self, key: &str) -> Option<Option<ImageId>> {
        self.by_name.get(key).copied()
    }

    /// Looks a module up by its handle: the actual base address.
    pub fn by_handle(&self, handle: GuestAddr) -> Option<ImageId> {
        self.images
            .iter()
            .position(|img| img.actual_base == handle)
            .map(ImageId)
    }

    /// Registers a freshly mapped image under its key.
    pub(crate) fn register(&mut self, image: LoadedImage) -> ImageId {
        let id = ImageId(self.images.len());
        self.by_name.insert(image.name.clone(), Some(id));
        self.images.push(image);
        id
    }

    /// Records a dependency whose file could not be found.
    pub(crate) fn register_missing(&mut self, key: String) {
        self.by_name.insert(key, None);
    }

    /// Allocates a synthesised stub, returning its guest address.
    pub(crate) fn alloc_stub(
        &mut self,
        mm: &mut MemoryManager,
        bytes: &[u8],
    ) -> Result<GuestAddr, MemError> {
        self.stubs.alloc(mm, bytes)
    }
}

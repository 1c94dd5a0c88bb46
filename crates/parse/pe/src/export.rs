//! Export directory parsing.

use crate::header::le_u32;
use crate::PeError;

/// Size of the `IMAGE_EXPORT_DIRECTORY` structure.
pub const EXPORT_DIRECTORY_SIZE: usize = 40;

/// The export directory of a mapped image.
///
/// All table fields are RVAs into the same image; the loader resolves them
/// through guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportDirectory {
    /// Ordinal base added to function-table indices.
    pub ordinal_base: u32,
    /// Number of entries in the address-of-functions table.
    pub number_of_functions: u32,
    /// Number of named exports.
    pub number_of_names: u32,
    /// RVA of the function RVA table (`u32` entries).
    pub address_of_functions: u32,
    /// RVA of the export-name RVA table (`u32` entries).
    pub address_of_names: u32,
    /// RVA of the name-to-ordinal-index table (`u16` entries).
    pub address_of_name_ordinals: u32,
}

impl ExportDirectory {
    /// Parses an export directory from `bytes` (at least 40 bytes).
    pub fn parse(bytes: &[u8]) -> Result<Self, PeError> {
        if bytes.len() < EXPORT_DIRECTORY_SIZE {
            return Err(PeError::Truncated);
        }
        Ok(Self {
            ordinal_base: le_u32(bytes, 16),
            number_of_functions: le_u32(bytes, 20),
            number_of_names: le_u32(bytes, 24),
            address_of_functions: le_u32(bytes, 28),
            address_of_names: le_u32(bytes, 32),
            address_of_name_ordinals: le_u32(bytes, 36),
        })
    }
}

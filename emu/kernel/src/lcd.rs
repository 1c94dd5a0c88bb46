//! The LCD handler.
//!
//! The guest discovers its display through a descriptor block that lives
//! *inside guest memory*: the handler heap-allocates the descriptor and
//! the 320×240 RGB555 framebuffer, lays the fields out by hand, and
//! publishes a pointer cell whose address the `GetActiveLCD` syscall
//! returns. The host never keeps references into guest memory — only the
//! guest addresses of what it placed there.

use muon_core::GuestAddr;
use muon_mm::{MemError, MemoryManager};

/// Guest base of the LCD control-register window.
pub const LCD_REGISTER_BASE: GuestAddr = GuestAddr::new(0x4C80_0000);

/// Size of the LCD control-register window.
pub const LCD_REGISTER_SIZE: u32 = 0x1000;

/// Panel width in pixels.
pub const LCD_WIDTH: u32 = 320;

/// Panel height in pixels.
pub const LCD_HEIGHT: u32 = 240;

/// Bits per pixel (RGB555).
const LCD_PIXEL_BITS: u16 = 16;

/// Framebuffer size in bytes.
pub(crate) const LCD_FRAMEBUFFER_BYTES: u32 = LCD_WIDTH * LCD_HEIGHT * 2;

/// Descriptor magic the guest checks for.
const LCD_MAGIC: u16 = 0x5850;

/// Size of the guest-side descriptor block.
const DESCRIPTOR_SIZE: u32 = 32;

/// Host-side record of the guest-resident LCD structures.
#[derive(Debug)]
pub(crate) struct Lcd {
    /// Guest address of the descriptor block.
    descriptor: GuestAddr,
    /// Guest address of the framebuffer (inside the same allocation).
    framebuffer: GuestAddr,
    /// Guest address of the 4-byte cell holding `descriptor`.
    pointer_cell: GuestAddr,
}

impl Lcd {
    /// Places the descriptor, framebuffer and pointer cell in guest heap
    /// memory and fills the descriptor fields.
    pub(crate) fn init(mem: &mut MemoryManager) -> Result<Self, MemError> {
        let descriptor = mem.heap_alloc(DESCRIPTOR_SIZE + LCD_FRAMEBUFFER_BYTES)?;
        let framebuffer = descriptor + DESCRIPTOR_SIZE;

        mem.write_u16(descriptor, LCD_MAGIC)?;
        mem.write_u16(descriptor + 2, LCD_WIDTH as u16)?;
        mem.write_u16(descriptor + 4, LCD_HEIGHT as u16)?;
        mem.write_u16(descriptor + 6, LCD_PIXEL_BITS)?;
        mem.write_u32(descriptor + 8, LCD_WIDTH * 2)?; // line stride in bytes
        mem.write_u32(descriptor + 12, 2)?;
        mem.write_u32(descriptor + 16, 8)?;
        mem.write_u32(descriptor + 20, framebuffer.as_u32())?;

        let pointer_cell = mem.heap_alloc(4)?;
        mem.write_u32(pointer_cell, descriptor.as_u32())?;

        Ok(Self {
            descriptor,
            framebuffer,
            pointer_cell,
        })
    }

    /// Guest address of the framebuffer.
    pub(crate) fn framebuffer(&self) -> GuestAddr {
        self.framebuffer
    }

    /// Guest address of the published pointer cell.
    pub(crate) fn pointer_cell(&self) -> GuestAddr {
        self.pointer_cell
    }

    /// Guest address of the descriptor block.
    #[cfg(test)]
    pub(crate) fn descriptor(&self) -> GuestAddr {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_layout_and_pointer_cell() {
        let mut mm = MemoryManager::new();
        let lcd = Lcd::init(&mut mm).unwrap();

        let d = lcd.descriptor();
        assert_eq!(mm.read_u16(d).unwrap(), LCD_MAGIC);
        assert_eq!(mm.read_u16(d + 2).unwrap(), 320);
        assert_eq!(mm.read_u16(d + 4).unwrap(), 240);
        assert_eq!(mm.read_u16(d + 6).unwrap(), 16);
        assert_eq!(mm.read_u32(d + 20).unwrap(), lcd.framebuffer().as_u32());

        // The pointer cell names the descriptor.
        assert_eq!(
            mm.read_u32(lcd.pointer_cell()).unwrap(),
            d.as_u32()
        );

        // The framebuffer is writable guest memory of the right size.
        let fb = lcd.framebuffer();
        mm.write_u16(fb + (LCD_FRAMEBUFFER_BYTES - 2), 0x7FFF).unwrap();
    }
}

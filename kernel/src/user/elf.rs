//! Minimal ELF32 reader: enough header and section-table parsing to find
//! the text, rodata, data and bss ranges and the entry point of a static
//! executable.

use crate::errors::{KernelError, KernelResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionRange {
    /// Virtual address the section loads at; 0 when absent.
    pub start: u32,
    pub len: u32,
    /// Byte offset of the section's contents in the image (bss has none).
    pub offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SimpleElf {
    pub entry: u32,
    pub text: SectionRange,
    pub rodata: SectionRange,
    pub data: SectionRange,
    pub bss: SectionRange,
}

const EHSIZE: usize = 52;
const SHT_PROGBITS: u32 = 1;
const SHT_NOBITS: u32 = 8;

fn read_u16(image: &[u8], offset: usize) -> KernelResult<u16> {
    let bytes = image
        .get(offset..offset + 2)
        .ok_or(KernelError::Failure)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(image: &[u8], offset: usize) -> KernelResult<u32> {
    let bytes = image
        .get(offset..offset + 4)
        .ok_or(KernelError::Failure)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn parse(image: &[u8]) -> KernelResult<SimpleElf> {
    if image.len() < EHSIZE || &image[0..4] != b"\x7FELF" {
        return Err(KernelError::Failure);
    }
    // 32-bit, little-endian, version 1, executable, i386
    if image[4] != 1 || image[5] != 1 || image[6] != 1 {
        return Err(KernelError::Failure);
    }
    if read_u16(image, 16)? != 2 || read_u16(image, 18)? != 3 {
        return Err(KernelError::Failure);
    }

    let entry = read_u32(image, 24)?;
    if entry == 0 {
        return Err(KernelError::Failure);
    }

    let shoff = read_u32(image, 32)? as usize;
    let shentsize = read_u16(image, 46)? as usize;
    let shnum = read_u16(image, 48)? as usize;
    let shstrndx = read_u16(image, 50)? as usize;
    if shentsize < 40 || shnum == 0 || shstrndx >= shnum {
        return Err(KernelError::Failure);
    }

    let strtab_hdr = shoff + shstrndx * shentsize;
    let strtab_off = read_u32(image, strtab_hdr + 16)? as usize;
    let strtab_len = read_u32(image, strtab_hdr + 20)? as usize;
    let strtab = image
        .get(strtab_off..strtab_off + strtab_len)
        .ok_or(KernelError::Failure)?;

    let mut elf = SimpleElf {
        entry,
        text: SectionRange::default(),
        rodata: SectionRange::default(),
        data: SectionRange::default(),
        bss: SectionRange::default(),
    };

    for i in 0..shnum {
        let hdr = shoff + i * shentsize;
        let name_off = read_u32(image, hdr)? as usize;
        let sh_type = read_u32(image, hdr + 4)?;
        let addr = read_u32(image, hdr + 12)?;
        let offset = read_u32(image, hdr + 16)?;
        let size = read_u32(image, hdr + 20)?;

        let name = section_name(strtab, name_off);
        let range = SectionRange {
            start: addr,
            len: size,
            offset,
        };
        match name {
            b".text" | b".rodata" | b".data" => {
                let end = (offset as usize)
                    .checked_add(size as usize)
                    .ok_or(KernelError::Failure)?;
                if sh_type != SHT_PROGBITS || image.get(offset as usize..end).is_none() {
                    return Err(KernelError::Failure);
                }
            }
            b".bss" => {
                if sh_type != SHT_NOBITS {
                    return Err(KernelError::Failure);
                }
            }
            _ => continue,
        }
        match name {
            b".text" => elf.text = range,
            b".rodata" => elf.rodata = range,
            b".data" => elf.data = range,
            b".bss" => elf.bss = range,
            _ => {}
        }
    }

    if elf.text.len == 0 {
        return Err(KernelError::Failure);
    }
    Ok(elf)
}

fn section_name(strtab: &[u8], offset: usize) -> &[u8] {
    let Some(rest) = strtab.get(offset..) else {
        return b"";
    };
    let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
    &rest[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::elf_image;

    #[test_case]
    fn roundtrip_through_image_builder() {
        let image = elf_image(0x0100_0000, &[0x90, 0x90, 0xEB, 0xFE]);
        let elf = parse(&image).unwrap();
        assert_eq!(elf.entry, 0x0100_0000);
        assert_eq!(elf.text.start, 0x0100_0000);
        assert_eq!(elf.text.len, 4);
        let text_off = elf.text.offset as usize;
        assert_eq!(&image[text_off..text_off + 4], &[0x90, 0x90, 0xEB, 0xFE]);
        assert_eq!(elf.bss.len, 0);
    }

    #[test_case]
    fn rejects_foreign_and_truncated_images() {
        assert!(parse(b"not an elf").is_err());
        let mut image = elf_image(0x0100_0000, &[0x90]);
        image[4] = 2; // 64-bit class
        assert!(parse(&image).is_err());
        let image = elf_image(0x0100_0000, &[0x90]);
        assert!(parse(&image[..20]).is_err());
    }
}

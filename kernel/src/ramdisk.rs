//! The program bundle: a flat name → bytes table the loader reads with
//! `getbytes`. The images for `idle` and `init` are synthesized at boot
//! from hand-encoded machine code, so the kernel always has something to
//! run even with no user build installed.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;

use crate::errors::{KernelError, KernelResult};
use crate::user::constants::{EXECNAME_MAX, USER_MEM_START, WAIT_VECTOR};

struct RamFile {
    name: String,
    bytes: Vec<u8>,
}

pub struct RamDisk {
    files: Vec<RamFile>,
}

impl RamDisk {
    pub fn from_files(files: Vec<(&str, Vec<u8>)>) -> RamDisk {
        RamDisk {
            files: files
                .into_iter()
                .filter(|(name, _)| name.len() <= EXECNAME_MAX)
                .map(|(name, bytes)| RamFile {
                    name: name.to_string(),
                    bytes,
                })
                .collect(),
        }
    }

    fn file(&self, name: &str) -> Option<&RamFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn getbytes(&self, name: &str, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        let file = self.file(name).ok_or(KernelError::Failure)?;
        if offset >= file.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(file.bytes.len() - offset);
        buf[..n].copy_from_slice(&file.bytes[offset..offset + n]);
        Ok(n)
    }

    pub fn file_size(&self, name: &str) -> KernelResult<usize> {
        Ok(self.file(name).ok_or(KernelError::Failure)?.bytes.len())
    }
}

static RAMDISK: OnceCell<RamDisk> = OnceCell::uninit();

pub fn init(files: Vec<(&str, Vec<u8>)>) {
    RAMDISK.init_once(|| RamDisk::from_files(files));
}

fn disk() -> KernelResult<&'static RamDisk> {
    RAMDISK.get().ok_or(KernelError::Failure)
}

pub fn getbytes(name: &str, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
    disk()?.getbytes(name, offset, buf)
}

pub fn file_size(name: &str) -> KernelResult<usize> {
    disk()?.file_size(name)
}

pub fn exists(name: &str) -> bool {
    disk().map(|d| d.file(name).is_some()).unwrap_or(false)
}

// Flat machine code for the built-in programs, linked at USER_MEM_START.
//
//   idle:  jmp $
const IDLE_TEXT: &[u8] = &[0xEB, 0xFE];

//   init:  xor esi, esi      ; wait(NULL)
//          int WAIT_VECTOR
//          jmp init          ; reap forever, discarding statuses
fn init_text() -> Vec<u8> {
    vec![0x31, 0xF6, 0xCD, WAIT_VECTOR, 0xEB, 0xFA]
}

pub fn builtin_files() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("idle", elf_image(USER_MEM_START, IDLE_TEXT)),
        ("init", elf_image(USER_MEM_START, &init_text())),
    ]
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Wrap raw text bytes in a minimal ELF executable: one .text section at
/// `entry` plus the section name table. Also used by tests to cook images
/// for the loader.
pub fn elf_image(entry: u32, text: &[u8]) -> Vec<u8> {
    const EHSIZE: usize = 52;
    const SHENTSIZE: usize = 40;
    let shstrtab: &[u8] = b"\0.text\0.shstrtab\0";
    let shstrtab_off = EHSIZE;
    let text_off = (shstrtab_off + shstrtab.len() + 3) & !3;
    let shoff = (text_off + text.len() + 3) & !3;

    let mut image = Vec::with_capacity(shoff + 3 * SHENTSIZE);

    // ELF header
    image.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    push_u16(&mut image, 2); // ET_EXEC
    push_u16(&mut image, 3); // EM_386
    push_u32(&mut image, 1);
    push_u32(&mut image, entry);
    push_u32(&mut image, 0); // no program headers
    push_u32(&mut image, shoff as u32);
    push_u32(&mut image, 0);
    push_u16(&mut image, EHSIZE as u16);
    push_u16(&mut image, 0);
    push_u16(&mut image, 0);
    push_u16(&mut image, SHENTSIZE as u16);
    push_u16(&mut image, 3);
    push_u16(&mut image, 2);

    image.extend_from_slice(shstrtab);
    image.resize(text_off, 0);
    image.extend_from_slice(text);
    image.resize(shoff, 0);

    // Null section header
    image.extend_from_slice(&[0; SHENTSIZE]);

    // .text
    push_u32(&mut image, 1);
    push_u32(&mut image, 1); // SHT_PROGBITS
    push_u32(&mut image, 6); // ALLOC | EXECINSTR
    push_u32(&mut image, entry);
    push_u32(&mut image, text_off as u32);
    push_u32(&mut image, text.len() as u32);
    push_u32(&mut image, 0);
    push_u32(&mut image, 0);
    push_u32(&mut image, 4);
    push_u32(&mut image, 0);

    // .shstrtab
    push_u32(&mut image, 7);
    push_u32(&mut image, 3); // SHT_STRTAB
    push_u32(&mut image, 0);
    push_u32(&mut image, 0);
    push_u32(&mut image, shstrtab_off as u32);
    push_u32(&mut image, shstrtab.len() as u32);
    push_u32(&mut image, 0);
    push_u32(&mut image, 0);
    push_u32(&mut image, 1);
    push_u32(&mut image, 0);

    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn getbytes_respects_offsets_and_bounds() {
        let disk = RamDisk::from_files(vec![("prog", vec![1, 2, 3, 4, 5])]);
        let mut buf = [0u8; 3];
        assert_eq!(disk.getbytes("prog", 0, &mut buf), Ok(3));
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(disk.getbytes("prog", 3, &mut buf), Ok(2));
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(disk.getbytes("prog", 9, &mut buf), Ok(0));
        assert_eq!(disk.getbytes("absent", 0, &mut buf), Err(KernelError::Failure));
    }

    #[test_case]
    fn builtin_images_parse() {
        for (name, image) in builtin_files() {
            let elf = crate::user::elf::parse(&image)
                .unwrap_or_else(|_| panic!("bad builtin image {name}"));
            assert_eq!(elf.entry, USER_MEM_START);
            assert_eq!(elf.text.start, USER_MEM_START);
            assert!(elf.text.len > 0);
        }
    }
}

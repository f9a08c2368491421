// src/kernel/process/elf.rs
//! ELF64 実行ファイルのヘッダ解析。
//!
//! `start_process` がこれを使い、`PT_LOAD` セグメントごとに遅延ロード用の
//! `PageEntry` を補助ページテーブルへ登録する。セグメント自体の読み込みは
//! 行わず、ページフォルト時まで先送りする。

use crate::kernel::core::traits::{FileHandle, FileSystem};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;
pub const PT_SHLIB: u32 = 5;
pub const PT_PHDR: u32 = 6;
pub const PT_STACK: u32 = 0x6474_e551;

pub const PF_EXEC: u32 = 1;
pub const PF_WRITE: u32 = 2;
pub const PF_READ: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub enum ElfError {
    ShortRead,
    BadMagic,
    WrongClass,
    WrongEndianness,
    WrongType,
    WrongMachine,
    UnsupportedVersion,
    BadSegment,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    #[must_use]
    pub fn writable(&self) -> bool {
        self.flags & PF_WRITE != 0
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        self.flags & PF_READ != 0
    }
}

fn read_exact(fs: &dyn FileSystem, handle: FileHandle, offset: u64, buf: &mut [u8]) -> Result<(), ElfError> {
    let saved = fs.tell(handle);
    fs.seek(handle, offset);
    let n = fs.read(handle, buf).map_err(|_| ElfError::ShortRead)?;
    fs.seek(handle, saved);
    if n != buf.len() {
        return Err(ElfError::ShortRead);
    }
    Ok(())
}

/// 実行ファイルの ELF ヘッダを読み取り検証する。
pub fn read_header(fs: &dyn FileSystem, handle: FileHandle) -> Result<ElfHeader, ElfError> {
    let mut raw = [0u8; 64];
    read_exact(fs, handle, 0, &mut raw)?;

    if raw[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if raw[4] != ELF_CLASS_64 {
        return Err(ElfError::WrongClass);
    }
    if raw[5] != ELF_DATA_LSB {
        return Err(ElfError::WrongEndianness);
    }

    let e_type = u16::from_le_bytes([raw[16], raw[17]]);
    if e_type != ET_EXEC {
        return Err(ElfError::WrongType);
    }
    let e_machine = u16::from_le_bytes([raw[18], raw[19]]);
    if e_machine != EM_X86_64 {
        return Err(ElfError::WrongMachine);
    }
    let e_version = u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]);
    if e_version != 1 {
        return Err(ElfError::UnsupportedVersion);
    }

    let entry = u64::from_le_bytes(raw[24..32].try_into().unwrap());
    let phoff = u64::from_le_bytes(raw[32..40].try_into().unwrap());
    let phentsize = u16::from_le_bytes([raw[54], raw[55]]);
    let phnum = u16::from_le_bytes([raw[56], raw[57]]);

    Ok(ElfHeader {
        entry,
        phoff,
        phentsize,
        phnum,
    })
}

/// `index` 番目のプログラムヘッダを読み取る。
pub fn read_program_header(
    fs: &dyn FileSystem,
    handle: FileHandle,
    header: &ElfHeader,
    index: u16,
) -> Result<ProgramHeader, ElfError> {
    let offset = header.phoff + u64::from(header.phentsize) * u64::from(index);
    let mut raw = [0u8; 56];
    read_exact(fs, handle, offset, &mut raw)?;

    let p_type = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let flags = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    let p_offset = u64::from_le_bytes(raw[8..16].try_into().unwrap());
    let vaddr = u64::from_le_bytes(raw[16..24].try_into().unwrap());
    let filesz = u64::from_le_bytes(raw[32..40].try_into().unwrap());
    let memsz = u64::from_le_bytes(raw[40..48].try_into().unwrap());
    let align = u64::from_le_bytes(raw[48..56].try_into().unwrap());

    Ok(ProgramHeader {
        p_type,
        flags,
        offset: p_offset,
        vaddr,
        filesz,
        memsz,
        align,
    })
}

/// セグメントがロード可能で、アドレス・サイズの整合性があるかを検証する。
///
/// ゼロページ(`vaddr == 0`)の読み込みや、`vaddr + memsz` のラップアラウンドは拒否する。
pub fn validate_segment(ph: &ProgramHeader) -> Result<bool, ElfError> {
    if ph.p_type != PT_LOAD {
        return Ok(false);
    }
    if ph.vaddr == 0 {
        return Err(ElfError::BadSegment);
    }
    if ph.filesz > ph.memsz {
        return Err(ElfError::BadSegment);
    }
    if ph.vaddr.checked_add(ph.memsz).is_none() {
        return Err(ElfError::BadSegment);
    }
    if ph.offset % ph.align.max(1) != ph.vaddr % ph.align.max(1) {
        return Err(ElfError::BadSegment);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fs::ramfs::RamFs;

    fn build_elf(entry: u64, phnum: u16) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 64];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELF_CLASS_64;
        buf[5] = ELF_DATA_LSB;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..32].copy_from_slice(&entry.to_le_bytes());
        buf[32..40].copy_from_slice(&64u64.to_le_bytes());
        buf[54..56].copy_from_slice(&56u16.to_le_bytes());
        buf[56..58].copy_from_slice(&phnum.to_le_bytes());
        buf
    }

    #[test]
    fn parses_valid_header() {
        let fs = RamFs::new();
        fs.seed_file("prog", &build_elf(0x40_0000, 0));
        let handle = fs.open("prog").unwrap();
        let header = read_header(&fs, handle).unwrap();
        assert_eq!(header.entry, 0x40_0000);
        assert_eq!(header.phnum, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let fs = RamFs::new();
        fs.seed_file("bad", &[0u8; 64]);
        let handle = fs.open("bad").unwrap();
        assert!(matches!(read_header(&fs, handle), Err(ElfError::BadMagic)));
    }

    #[test]
    fn rejects_zero_vaddr_segment() {
        let ph = ProgramHeader {
            p_type: PT_LOAD,
            flags: PF_READ | PF_EXEC,
            offset: 0,
            vaddr: 0,
            filesz: 0x1000,
            memsz: 0x1000,
            align: 0x1000,
        };
        assert!(matches!(validate_segment(&ph), Err(ElfError::BadSegment)));
    }
}

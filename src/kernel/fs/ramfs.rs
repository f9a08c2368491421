// src/kernel/fs/ramfs.rs
//! メモリ上に実体を持つ簡易ファイルシステム。
//!
//! `FileSystem` trait の具体実装。ディスクドライバを持たないため、ファイルの
//! 内容はすべて `Vec<u8>` としてヒープ上に保持する。単一のグローバルロックの
//! 下で動作し、`open`/`reopen` のたびに独立したカーソルを持つハンドルを払い出す。

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::kernel::core::result::{ErrorKind, KernelError, MemoryError};
use crate::kernel::core::traits::{FileHandle, FileSystem, InodeId};
use crate::kernel::core::KernelResult;

struct Inode {
    id: InodeId,
    data: Arc<Mutex<Vec<u8>>>,
}

struct OpenFile {
    inode: usize,
    position: u64,
    write_denied: bool,
}

struct RamFsInner {
    /// ファイル名 → inode スロット index
    names: BTreeMap<String, usize>,
    inodes: Vec<Option<Inode>>,
    next_inode_id: u64,
    handles: Vec<Option<OpenFile>>,
    free_handles: Vec<usize>,
}

impl RamFsInner {
    fn new() -> Self {
        Self {
            names: BTreeMap::new(),
            inodes: Vec::new(),
            next_inode_id: 1,
            handles: Vec::new(),
            free_handles: Vec::new(),
        }
    }

    fn alloc_handle(&mut self, inode: usize) -> FileHandle {
        let open = OpenFile {
            inode,
            position: 0,
            write_denied: false,
        };
        if let Some(slot) = self.free_handles.pop() {
            self.handles[slot] = Some(open);
            FileHandle(slot as u64)
        } else {
            self.handles.push(Some(open));
            FileHandle((self.handles.len() - 1) as u64)
        }
    }

    fn handle(&self, handle: FileHandle) -> Option<&OpenFile> {
        self.handles.get(handle.0 as usize)?.as_ref()
    }

    fn handle_mut(&mut self, handle: FileHandle) -> Option<&mut OpenFile> {
        self.handles.get_mut(handle.0 as usize)?.as_mut()
    }
}

/// メモリ上ファイルシステム
pub struct RamFs {
    inner: Mutex<RamFsInner>,
}

impl RamFs {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RamFsInner::new()),
        }
    }

    /// テストや起動時のシード用に、名前付きファイルを直接内容から作る。
    pub fn seed_file(&self, name: &str, contents: &[u8]) {
        let mut inner = self.inner.lock();
        let slot = inner.inodes.len();
        let id = InodeId(inner.next_inode_id);
        inner.next_inode_id += 1;
        inner.inodes.push(Some(Inode {
            id,
            data: Arc::new(Mutex::new(contents.to_vec())),
        }));
        inner.names.insert(String::from(name), slot);
    }
}

fn not_found() -> KernelError {
    KernelError::from(ErrorKind::Memory(MemoryError::InvalidAddress))
}

impl FileSystem for RamFs {
    fn open(&self, name: &str) -> KernelResult<FileHandle> {
        let mut inner = self.inner.lock();
        let slot = *inner.names.get(name).ok_or_else(not_found)?;
        Ok(inner.alloc_handle(slot))
    }

    fn create(&self, name: &str, initial_size: usize) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if inner.names.contains_key(name) {
            return Ok(());
        }
        let slot = inner.inodes.len();
        let id = InodeId(inner.next_inode_id);
        inner.next_inode_id += 1;
        inner.inodes.push(Some(Inode {
            id,
            data: Arc::new(Mutex::new(alloc::vec![0u8; initial_size])),
        }));
        inner.names.insert(String::from(name), slot);
        Ok(())
    }

    fn remove(&self, name: &str) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        // Unix 的な意味論：既存のハンドルは開いたままでよい。名前空間からだけ外す。
        inner.names.remove(name).map(|_| ()).ok_or_else(not_found)
    }

    fn close(&self, handle: FileHandle) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.handles.get_mut(handle.0 as usize) {
            *slot = None;
            inner.free_handles.push(handle.0 as usize);
        }
    }

    fn read(&self, handle: FileHandle, buf: &mut [u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let open = inner.handle(handle).ok_or_else(not_found)?;
        let inode_slot = open.inode;
        let position = open.position;
        let data = inner.inodes[inode_slot]
            .as_ref()
            .ok_or_else(not_found)?
            .data
            .clone();
        let data = data.lock();
        let start = (position as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        drop(data);
        if let Some(open) = inner.handle_mut(handle) {
            open.position = position + n as u64;
        }
        Ok(n)
    }

    fn write(&self, handle: FileHandle, buf: &[u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let open = inner.handle(handle).ok_or_else(not_found)?;
        if open.write_denied {
            return Err(KernelError::from(ErrorKind::Memory(MemoryError::InvalidAddress)));
        }
        let inode_slot = open.inode;
        let position = open.position;
        let data = inner.inodes[inode_slot]
            .as_ref()
            .ok_or_else(not_found)?
            .data
            .clone();
        let mut data = data.lock();
        let end = position as usize + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[position as usize..end].copy_from_slice(buf);
        drop(data);
        if let Some(open) = inner.handle_mut(handle) {
            open.position = end as u64;
        }
        Ok(buf.len())
    }

    fn seek(&self, handle: FileHandle, pos: u64) {
        let mut inner = self.inner.lock();
        if let Some(open) = inner.handle_mut(handle) {
            open.position = pos;
        }
    }

    fn tell(&self, handle: FileHandle) -> u64 {
        let inner = self.inner.lock();
        inner.handle(handle).map_or(0, |o| o.position)
    }

    fn length(&self, handle: FileHandle) -> u64 {
        let inner = self.inner.lock();
        let Some(open) = inner.handle(handle) else {
            return 0;
        };
        let Some(inode) = &inner.inodes[open.inode] else {
            return 0;
        };
        inode.data.lock().len() as u64
    }

    fn reopen(&self, handle: FileHandle) -> KernelResult<FileHandle> {
        let mut inner = self.inner.lock();
        let inode_slot = inner.handle(handle).ok_or_else(not_found)?.inode;
        Ok(inner.alloc_handle(inode_slot))
    }

    fn deny_write(&self, handle: FileHandle) {
        let mut inner = self.inner.lock();
        if let Some(open) = inner.handle_mut(handle) {
            open.write_denied = true;
        }
    }

    fn inode_of(&self, handle: FileHandle) -> InodeId {
        let inner = self.inner.lock();
        inner
            .handle(handle)
            .and_then(|o| inner.inodes[o.inode].as_ref())
            .map_or(InodeId(0), |i| i.id)
    }
}

lazy_static! {
    pub static ref RAMFS: RamFs = RamFs::new();
}

/// Adapts a `RAMFS` handle to the `FileDescriptor` trait so regular files can
/// sit in a process's fd table next to pipes.
pub struct RamFileDescriptor {
    pub handle: FileHandle,
}

impl super::FileDescriptor for RamFileDescriptor {
    fn read(&mut self, buf: &mut [u8]) -> super::FileResult<usize> {
        RAMFS.read(self.handle, buf).map_err(|_| super::FileError::Other)
    }

    fn write(&mut self, buf: &[u8]) -> super::FileResult<usize> {
        RAMFS.write(self.handle, buf).map_err(|_| super::FileError::Other)
    }

    fn close(&mut self) -> super::FileResult<()> {
        RAMFS.close(self.handle);
        Ok(())
    }

    fn ramfs_handle(&self) -> Option<FileHandle> {
        Some(self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let fs = RamFs::new();
        fs.create("hello.txt", 0).unwrap();
        let h = fs.open("hello.txt").unwrap();
        fs.write(h, b"hello world").unwrap();
        fs.seek(h, 0);
        let mut buf = [0u8; 11];
        let n = fs.read(h, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn reopen_has_independent_cursor() {
        let fs = RamFs::new();
        fs.create("f", 0).unwrap();
        let h1 = fs.open("f").unwrap();
        fs.write(h1, b"abcdef").unwrap();
        let h2 = fs.reopen(h1).unwrap();
        fs.seek(h1, 3);
        assert_eq!(fs.tell(h1), 3);
        assert_eq!(fs.tell(h2), 0);
        let mut buf = [0u8; 3];
        fs.read(h2, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn deny_write_rejects_further_writes() {
        let fs = RamFs::new();
        fs.create("exe", 4).unwrap();
        let h = fs.open("exe").unwrap();
        fs.deny_write(h);
        assert!(fs.write(h, b"x").is_err());
    }

    #[test]
    fn same_file_reports_same_inode() {
        let fs = RamFs::new();
        fs.create("a", 0).unwrap();
        let h1 = fs.open("a").unwrap();
        let h2 = fs.open("a").unwrap();
        assert_eq!(fs.inode_of(h1), fs.inode_of(h2));
    }
}

// src/kernel/mm/share.rs
//! 読み取り専用実行セグメント用の共有フレームテーブル。
//!
//! 同じファイルの同じ範囲を複数プロセスがロードするとき、物理フレームを
//! 1 つだけ確保して使い回す。キーは `(inode, position, bytes_read)`。

use alloc::collections::BTreeMap;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::kernel::core::result::{ErrorKind, KernelError, MemoryError};
use crate::kernel::core::traits::{FileHandle, FileSystem};
use crate::kernel::core::KernelResult;
use crate::kernel::process::ProcessId;

use super::frame::{FrameHandle, FRAME_TABLE};
use super::supplemental::PageSource;

/// 共有テーブルのキー。ファイル identity・オフセット・読み込みバイト数の組。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShareKey {
    inode: u64,
    position: u64,
    bytes_read: u32,
}

impl ShareKey {
    #[must_use]
    pub fn new(source: &PageSource) -> Self {
        Self {
            inode: source.inode.0,
            position: source.offset,
            bytes_read: source.bytes_read,
        }
    }
}

struct ShareEntry {
    frame: FrameHandle,
    refcount: usize,
}

/// 読み取り専用実行フレームの共有テーブル
pub struct ShareTable {
    entries: BTreeMap<ShareKey, ShareEntry>,
}

impl ShareTable {
    const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// 既存エントリがあれば参照カウントを増やして共有し、なければ新しい非書き込み
    /// フレームを確保してファイルから読み込み、テーブルに登録する。
    ///
    /// この呼び出し全体が、他のローダーと競合してフレームを二重に作らないための
    /// 臨界区間を構成する（`self` への排他参照で表現される）。
    pub fn get_frame(
        &mut self,
        key: ShareKey,
        owner: ProcessId,
        vaddr: VirtAddr,
        fs: &dyn FileSystem,
        file: FileHandle,
    ) -> KernelResult<FrameHandle> {
        let _lock_order = crate::sync::acquire_lock(crate::sync::LockId::Share);

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refcount += 1;
            FRAME_TABLE.lock().add_owner(entry.frame, owner, vaddr, false)?;
            return Ok(entry.frame);
        }

        let handle = FRAME_TABLE.lock().get_user_page(true, false)?;
        let kaddr = FRAME_TABLE
            .lock()
            .kaddr(handle)
            .ok_or_else(|| KernelError::from(ErrorKind::Memory(MemoryError::FrameTableExhausted)))?;

        let saved_pos = fs.tell(file);
        fs.seek(file, key.position);
        let buf = unsafe {
            core::slice::from_raw_parts_mut(kaddr as *mut u8, key.bytes_read as usize)
        };
        let n = fs
            .read(file, buf)
            .map_err(|_| KernelError::from(ErrorKind::Memory(MemoryError::InvalidPageFault)))?;
        fs.seek(file, saved_pos);
        if (n as u32) < key.bytes_read {
            FRAME_TABLE.lock().free(handle, owner, vaddr);
            return Err(KernelError::from(ErrorKind::Memory(MemoryError::InvalidPageFault)));
        }

        FRAME_TABLE.lock().add_owner(handle, owner, vaddr, false)?;
        self.entries.insert(
            key,
            ShareEntry {
                frame: handle,
                refcount: 1,
            },
        );
        Ok(handle)
    }

    /// エントリを解放する。参照カウントがゼロになればテーブルとフレームを両方解放する。
    ///
    /// # Panics
    /// 未知のキーで呼ばれた場合（share table の不変条件違反）。
    pub fn release(&mut self, key: ShareKey, owner: ProcessId, vaddr: VirtAddr) {
        let _lock_order = crate::sync::acquire_lock(crate::sync::LockId::Share);
        let refcount_after = {
            let entry = self
                .entries
                .get_mut(&key)
                .expect("share table release of unknown key");
            entry.refcount -= 1;
            entry.refcount
        };

        if refcount_after == 0 {
            let frame = self.entries.remove(&key).expect("just looked up").frame;
            FRAME_TABLE.lock().free(frame, owner, vaddr);
        } else {
            let frame = self.entries.get(&key).expect("just looked up").frame;
            FRAME_TABLE.lock().remove_owner(frame, owner, vaddr);
        }
    }
}

lazy_static! {
    pub static ref SHARE_TABLE: Mutex<ShareTable> = Mutex::new(ShareTable::new());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::core::traits::{FileHandle, InodeId};
    use crate::kernel::fs::ramfs::RAMFS;

    fn source(offset: u64, bytes_read: u32) -> PageSource {
        PageSource {
            file: FileHandle(0),
            inode: InodeId(7),
            offset,
            bytes_read,
            zero_bytes: 4096 - bytes_read,
        }
    }

    #[test]
    fn share_key_depends_on_inode_offset_and_length() {
        let a = ShareKey::new(&source(0, 4096));
        let b = ShareKey::new(&source(0, 4096));
        let c = ShareKey::new(&source(4096, 4096));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn get_frame_fails_cleanly_without_a_physical_allocator() {
        let mut table = ShareTable::new();
        let key = source(0, 4096);
        let fs = &*RAMFS;
        let result = table.get_frame(ShareKey::new(&key), ProcessId::new(1), VirtAddr::new(0x1000), fs, FileHandle(0));
        assert!(result.is_err(), "no boot-time frame allocator is installed in this test binary");
    }

    #[test]
    #[should_panic(expected = "unknown key")]
    fn release_panics_on_unknown_key() {
        let mut table = ShareTable::new();
        table.release(ShareKey::new(&source(0, 4096)), ProcessId::new(1), VirtAddr::new(0x1000));
    }
}

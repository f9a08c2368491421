// src/kernel/mm/supplemental.rs
//! 補助ページテーブル：プロセスごとの仮想アドレス → ページメタデータの写像。
//!
//! プロセス専有のデータ構造なので、このテーブル自体にロックは要らない
//! （`ProcessMem` の持ち主スレッドだけが書き込む）。エントリの操作が
//! フレーム／共有テーブルのロックを取ることはある。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use x86_64::VirtAddr;

use crate::kernel::core::traits::{FileHandle, InodeId};
use crate::kernel::core::KernelResult;
use crate::kernel::process::ProcessId;

use super::frame::{FrameHandle, FRAME_TABLE};
use super::share::{ShareKey, SHARE_TABLE};

/// ページが常駐していないときに内容を再構成するための情報
#[derive(Debug, Clone, Copy)]
pub struct PageSource {
    pub file: FileHandle,
    pub inode: InodeId,
    pub offset: u64,
    pub bytes_read: u32,
    pub zero_bytes: u32,
}

/// 1 ユーザー仮想ページ分のメタデータ
#[derive(Debug, Clone)]
pub struct PageEntry {
    pub vaddr: VirtAddr,
    pub source: Option<PageSource>,
    pub writable: bool,
    pub read_only_exec: bool,
    pub mmap: bool,
    pub frame: Option<FrameHandle>,
}

impl PageEntry {
    /// ソースファイルを持たないゼロ初期化ページ（スタックページなど）
    #[must_use]
    pub fn anonymous(vaddr: VirtAddr, writable: bool) -> Self {
        Self {
            vaddr,
            source: None,
            writable,
            read_only_exec: false,
            mmap: false,
            frame: None,
        }
    }

    /// ELF の `PT_LOAD` セグメント由来のページ
    #[must_use]
    pub fn from_segment(vaddr: VirtAddr, source: PageSource, writable: bool) -> Self {
        Self {
            vaddr,
            source: Some(source),
            writable,
            read_only_exec: !writable,
            mmap: false,
            frame: None,
        }
    }

    /// `mmap` 由来のページ
    #[must_use]
    pub fn from_mmap(vaddr: VirtAddr, source: PageSource) -> Self {
        Self {
            vaddr,
            source: Some(source),
            writable: true,
            read_only_exec: false,
            mmap: true,
            frame: None,
        }
    }
}

/// プロセスごとの補助ページテーブル
pub struct SupplementalPageTable {
    owner: ProcessId,
    entries: BTreeMap<u64, PageEntry>,
}

impl SupplementalPageTable {
    #[must_use]
    pub fn new(owner: ProcessId) -> Self {
        Self {
            owner,
            entries: BTreeMap::new(),
        }
    }

    /// 同じ `vaddr` の既存エントリを置き換えて挿入する。
    pub fn insert(&mut self, entry: PageEntry) {
        self.entries.insert(entry.vaddr.as_u64(), entry);
    }

    #[must_use]
    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        self.entries.contains_key(&page_key(vaddr))
    }

    #[must_use]
    pub fn get(&self, vaddr: VirtAddr) -> Option<&PageEntry> {
        self.entries.get(&page_key(vaddr))
    }

    pub fn get_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageEntry> {
        self.entries.get_mut(&page_key(vaddr))
    }

    /// フレームを解放し（rox は share table 経由で）、エントリを取り除く。
    /// mmap ページが dirty なまま常駐していれば、解放前にファイルへ書き戻す。
    pub fn remove(&mut self, vaddr: VirtAddr) {
        if let Some(entry) = self.entries.remove(&page_key(vaddr)) {
            self.writeback_if_dirty(&entry);
            self.free_frame(&entry);
        }
    }

    fn writeback_if_dirty(&self, entry: &PageEntry) {
        if !entry.mmap || entry.frame.is_none() {
            return;
        }
        let Some(source) = &entry.source else {
            return;
        };
        if !super::user_paging::is_dirty(self.owner, entry.vaddr) {
            return;
        }
        let handle = entry.frame.expect("checked above");
        if let Some(kaddr) = FRAME_TABLE.lock().kaddr(handle) {
            let _ = write_mmap_source(source, kaddr as *const u8, 4096);
        }
    }

    fn free_frame(&self, entry: &PageEntry) {
        let Some(handle) = entry.frame else {
            return;
        };
        if entry.read_only_exec {
            if let Some(source) = &entry.source {
                let key = ShareKey::new(source);
                SHARE_TABLE.lock().release(key, self.owner, entry.vaddr);
                return;
            }
        }
        FRAME_TABLE.lock().free(handle, self.owner, entry.vaddr);
    }

    /// プロセス終了時、すべてのエントリをハードウェアページテーブルから外し解放する。
    pub fn destroy(&mut self) {
        let vaddrs: Vec<u64> = self.entries.keys().copied().collect();
        for v in vaddrs {
            self.remove(VirtAddr::new(v));
        }
    }

    /// `vaddr` を含むページまでスタックを伸長する。ゼロ初期化された書き込み可能ページを
    /// 1 枚追加するだけで、ソースファイルは持たない。
    pub fn allocate_stack_page(&mut self, vaddr: VirtAddr) -> KernelResult<()> {
        let page_addr = VirtAddr::new(vaddr.as_u64() & !0xFFF);
        if self.contains(page_addr) {
            return Ok(());
        }
        let handle = FRAME_TABLE.lock().get_user_page(true, true)?;
        FRAME_TABLE
            .lock()
            .add_owner(handle, self.owner, page_addr, true)?;
        let mut entry = PageEntry::anonymous(page_addr, true);
        entry.frame = Some(handle);
        self.insert(entry);
        Ok(())
    }
}

fn page_key(vaddr: VirtAddr) -> u64 {
    vaddr.as_u64() & !0xFFF
}

/// mmap ページの内容をファイルから `dst` へ読み直す。退避復帰・初回読み込み兼用。
pub(crate) fn read_mmap_source(source: &PageSource, dst: *mut u8, cap: usize) -> KernelResult<()> {
    use crate::kernel::core::result::{ErrorKind, KernelError, MemoryError};
    use crate::kernel::core::traits::FileSystem;
    use crate::kernel::fs::ramfs::RAMFS;

    let _lock_order = crate::sync::acquire_lock(crate::sync::LockId::Filesystem);

    let fs = &*RAMFS;
    let saved = fs.tell(source.file);
    fs.seek(source.file, source.offset);

    let n = (source.bytes_read as usize).min(cap);
    let buf = unsafe { core::slice::from_raw_parts_mut(dst, n) };
    let read = fs
        .read(source.file, buf)
        .map_err(|_| KernelError::from(ErrorKind::Memory(MemoryError::InvalidPageFault)))?;
    if read < n {
        return Err(KernelError::from(ErrorKind::Memory(MemoryError::InvalidPageFault)));
    }
    let zero_len = (source.zero_bytes as usize).min(cap.saturating_sub(n));
    if zero_len > 0 {
        unsafe { core::ptr::write_bytes(dst.add(n), 0, zero_len) };
    }
    fs.seek(source.file, saved);
    Ok(())
}

/// dirty な mmap ページの内容を `src` からファイルへ書き戻す。
pub(crate) fn write_mmap_source(source: &PageSource, src: *const u8, cap: usize) -> KernelResult<()> {
    use crate::kernel::core::result::{ErrorKind, KernelError, MemoryError};
    use crate::kernel::core::traits::FileSystem;
    use crate::kernel::fs::ramfs::RAMFS;

    let _lock_order = crate::sync::acquire_lock(crate::sync::LockId::Filesystem);

    let fs = &*RAMFS;
    let saved = fs.tell(source.file);
    fs.seek(source.file, source.offset);

    let n = (source.bytes_read as usize).min(cap);
    let buf = unsafe { core::slice::from_raw_parts(src, n) };
    fs.write(source.file, buf)
        .map_err(|_| KernelError::from(ErrorKind::Memory(MemoryError::InvalidPageFault)))?;
    fs.seek(source.file, saved);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::core::traits::{FileHandle, InodeId};

    fn owner() -> ProcessId {
        ProcessId::new(999)
    }

    #[test]
    fn page_key_rounds_down_to_page_boundary() {
        let mut table = SupplementalPageTable::new(owner());
        table.insert(PageEntry::anonymous(VirtAddr::new(0x4000), true));

        assert!(table.contains(VirtAddr::new(0x4000)));
        assert!(table.contains(VirtAddr::new(0x4ABC)));
        assert!(!table.contains(VirtAddr::new(0x5000)));
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let mut table = SupplementalPageTable::new(owner());
        let source = PageSource {
            file: FileHandle(1),
            inode: InodeId(1),
            offset: 0,
            bytes_read: 4096,
            zero_bytes: 0,
        };
        table.insert(PageEntry::from_segment(VirtAddr::new(0x8000), source, false));

        let entry = table.get(VirtAddr::new(0x8000)).expect("just inserted");
        assert!(entry.read_only_exec);
        assert!(entry.frame.is_none());
    }

    #[test]
    fn allocate_stack_page_is_idempotent_for_an_already_resident_page() {
        let mut table = SupplementalPageTable::new(owner());
        table.insert(PageEntry::anonymous(VirtAddr::new(0x1000), true));

        assert!(table.allocate_stack_page(VirtAddr::new(0x1000)).is_ok());
    }

    #[test]
    fn allocate_stack_page_fails_without_a_frame_allocator() {
        let mut table = SupplementalPageTable::new(owner());
        assert!(table.allocate_stack_page(VirtAddr::new(0x2000)).is_err());
    }

    #[test]
    fn remove_clears_an_unbacked_entry() {
        let mut table = SupplementalPageTable::new(owner());
        table.insert(PageEntry::anonymous(VirtAddr::new(0x9000), true));
        assert!(table.contains(VirtAddr::new(0x9000)));

        table.remove(VirtAddr::new(0x9000));
        assert!(!table.contains(VirtAddr::new(0x9000)));
    }
}

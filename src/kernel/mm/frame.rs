// src/kernel/mm/frame.rs
//! 物理フレーム管理。
//!
//! 二つの役割を持つ:
//! - `BootInfoFrameAllocator`: ブートローダのメモリマップから物理フレームを
//!   供給する、ページテーブル用の低レベルアロケータ。
//! - `FrameTable`: ユーザーページを裏付ける物理フレームのテーブル。セカンド
//!   チャンス方式でエビクションを行い、スワップ・共有テーブルと連携する。

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::kernel::core::result::{ErrorKind, KernelError, MemoryError};
use crate::kernel::core::KernelResult;
use crate::kernel::process::ProcessId;

use super::allocator::BOOT_INFO_ALLOCATOR;
use super::supplemental::PageSource;
use super::PHYS_MEM_OFFSET;

/// ブート時のメモリマップから物理フレームを供給するアロケータ。
///
/// 割り当て済みフレームの解放はフリーリストで受け取り、次回の `allocate_frame`
/// で優先的に再利用する。フリーリストが空のときだけメモリマップを走査する。
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
    freed: Vec<PhysFrame>,
}

impl BootInfoFrameAllocator {
    /// # Safety
    /// `memory_map` に `Usable` として記載された範囲は、他の用途に使われていない
    /// 実際に空いている物理メモリでなければならない。
    #[must_use]
    pub unsafe fn init(memory_map: &'static MemoryMap) -> Self {
        Self {
            memory_map,
            next: 0,
            freed: Vec::new(),
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> + '_ {
        let regions = self.memory_map.iter();
        let usable = regions.filter(|r| r.region_type == MemoryRegionType::Usable);
        let ranges = usable.map(|r| r.range.start_addr()..r.range.end_addr());
        let frame_addresses = ranges.flat_map(|r| r.step_by(4096));
        frame_addresses.map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(frame) = self.freed.pop() {
            return Some(frame);
        }
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

unsafe impl FrameDeallocator<Size4KiB> for BootInfoFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.freed.push(frame);
    }
}

/// フレームテーブル内のスラブインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameHandle(usize);

struct FrameEntry {
    /// 常駐中の物理フレーム。退避中は `None`。
    phys: Option<PhysFrame>,
    /// 退避先のスワップスロット。常駐中は `None`。
    swap_index: Option<super::swap::SwapIndex>,
    /// `(owner, vaddr)` の集合。非共有フレームは高々 1 要素。
    owners: Vec<(ProcessId, VirtAddr)>,
    /// オーナーのハードウェアページテーブルに書き込み可能としてインストールするか
    writable: bool,
    /// mmap ページの場合、書き戻し先を特定するための情報
    mmap_source: Option<PageSource>,
}

/// ユーザーページを裏付ける物理フレームのテーブル。
///
/// ハッシュ集合（スラブ `Vec<Option<FrameEntry>>`）と、セカンドチャンス走査用の
/// 確保順キューを 1 つのロックで保護する。
pub struct FrameTable {
    entries: Vec<Option<FrameEntry>>,
    free_slots: Vec<usize>,
    order: VecDeque<FrameHandle>,
}

impl FrameTable {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_slots: Vec::new(),
            order: VecDeque::new(),
        }
    }

    fn insert_entry(&mut self, entry: FrameEntry) -> FrameHandle {
        if let Some(idx) = self.free_slots.pop() {
            self.entries[idx] = Some(entry);
            FrameHandle(idx)
        } else {
            self.entries.push(Some(entry));
            FrameHandle(self.entries.len() - 1)
        }
    }

    fn entry(&self, handle: FrameHandle) -> &FrameEntry {
        self.entries[handle.0].as_ref().expect("dangling frame handle")
    }

    fn entry_mut(&mut self, handle: FrameHandle) -> &mut FrameEntry {
        self.entries[handle.0].as_mut().expect("dangling frame handle")
    }

    /// フレームが常駐している場合、その物理アドレスをオフセットマッピング越しの
    /// カーネル仮想アドレスとして返す。
    #[must_use]
    pub fn kaddr(&self, handle: FrameHandle) -> Option<u64> {
        let offset = PHYS_MEM_OFFSET.load(Ordering::Relaxed);
        self.entry(handle).phys.map(|f| offset + f.start_address().as_u64())
    }

    fn alloc_raw_frame(&mut self, zero: bool) -> KernelResult<PhysFrame> {
        loop {
            let frame = {
                let mut allocator = BOOT_INFO_ALLOCATOR.lock();
                allocator.as_mut().and_then(FrameAllocator::allocate_frame)
            };
            if let Some(frame) = frame {
                if zero {
                    let offset = PHYS_MEM_OFFSET.load(Ordering::Relaxed);
                    let ptr = (offset + frame.start_address().as_u64()) as *mut u8;
                    unsafe { core::ptr::write_bytes(ptr, 0, 4096) };
                }
                return Ok(frame);
            }
            self.evict_one()?;
        }
    }

    /// ユーザープールから 1 フレームを確保する。空きがなければエビクションしてから再試行する。
    pub fn get_user_page(&mut self, zero: bool, writable: bool) -> KernelResult<FrameHandle> {
        let frame = self.alloc_raw_frame(zero)?;
        let handle = self.insert_entry(FrameEntry {
            phys: Some(frame),
            swap_index: None,
            owners: Vec::new(),
            writable,
            mmap_source: None,
        });
        self.order.push_back(handle);
        Ok(handle)
    }

    /// フレームが mmap 由来であることを登録し、退避時の書き戻し先を記録する。
    pub fn set_mmap_source(&mut self, handle: FrameHandle, source: PageSource) {
        self.entry_mut(handle).mmap_source = Some(source);
    }

    /// `(owner, vaddr)` をこのフレームの所有者として追加し、ハードウェアページ
    /// テーブルにマッピングをインストールする。退避中であれば先に `swap_in` する。
    pub fn add_owner(
        &mut self,
        handle: FrameHandle,
        owner: ProcessId,
        vaddr: VirtAddr,
        writable: bool,
    ) -> KernelResult<()> {
        self.swap_in(handle)?;

        let frame = self.entry(handle).phys.expect("just swapped in");
        if !super::user_paging::install_mapping(owner, vaddr, frame, writable) {
            return Err(KernelError::from(ErrorKind::Memory(MemoryError::InvalidPageFault)));
        }

        let entry = self.entry_mut(handle);
        if !entry.owners.iter().any(|o| *o == (owner, vaddr)) {
            entry.owners.push((owner, vaddr));
        }
        Ok(())
    }

    /// `(owner, vaddr)` をフレームの所有者集合から取り除き、ハードウェアマッピングを外す。
    pub fn remove_owner(&mut self, handle: FrameHandle, owner: ProcessId, vaddr: VirtAddr) {
        super::user_paging::clear_mapping(owner, vaddr);
        self.entry_mut(handle).owners.retain(|o| *o != (owner, vaddr));
    }

    /// フレームが退避中なら新しい物理フレームへ内容を復元し、すべての所有者の
    /// ハードウェアページテーブルにマッピングを再インストールする。常駐中なら何もしない。
    ///
    /// `add_owner` から再帰的に呼ばれうるため、フレームテーブルのロックが既に
    /// 保持されている前提のコードパス（このメソッド自身）から再取得は行わない。
    pub fn swap_in(&mut self, handle: FrameHandle) -> KernelResult<()> {
        if self.entry(handle).phys.is_some() {
            return Ok(());
        }

        let frame = self.alloc_raw_frame(false)?;
        let offset = PHYS_MEM_OFFSET.load(Ordering::Relaxed);
        let dst = (offset + frame.start_address().as_u64()) as *mut u8;

        let swap_index = self.entry(handle).swap_index;
        let mmap_source = self.entry(handle).mmap_source;

        if let Some(source) = mmap_source {
            super::supplemental::read_mmap_source(&source, dst, 4096)?;
        } else if let Some(index) = swap_index {
            super::swap::SWAP.lock().read_in(index, dst)?;
        } else {
            unsafe { core::ptr::write_bytes(dst, 0, 4096) };
        }

        let writable = self.entry(handle).writable;
        let owners = self.entry(handle).owners.clone();
        {
            let entry = self.entry_mut(handle);
            entry.phys = Some(frame);
            entry.swap_index = None;
        }
        self.order.push_back(handle);

        for (pid, vaddr) in owners {
            super::user_paging::install_mapping(pid, vaddr, frame, writable);
        }
        Ok(())
    }

    /// 単一所有者のフレームを解放する。共有（rox）フレームは share table 経由でのみ
    /// 解放すること。
    ///
    /// # Panics
    /// 呼び出し時点で所有者が 2 つ以上残っている場合。
    pub fn free(&mut self, handle: FrameHandle, owner: ProcessId, vaddr: VirtAddr) {
        super::user_paging::clear_mapping(owner, vaddr);

        let entry = self.entries[handle.0].take().expect("dangling frame handle");
        assert!(
            entry.owners.len() <= 1,
            "free() called on a multi-owner frame; release via the share table instead"
        );

        if let Some(frame) = entry.phys {
            self.order.retain(|h| *h != handle);
            let mut allocator = BOOT_INFO_ALLOCATOR.lock();
            if let Some(a) = allocator.as_mut() {
                unsafe { a.deallocate_frame(frame) };
            }
        } else if let Some(index) = entry.swap_index {
            super::swap::SWAP.lock().free(index);
        }

        self.free_slots.push(handle.0);
    }

    /// セカンドチャンス方式で 1 フレームを選び退避する。
    fn evict_one(&mut self) -> KernelResult<()> {
        let _lock_order = crate::sync::acquire_lock(crate::sync::LockId::Frame);
        loop {
            let Some(candidate) = self.order.pop_front() else {
                return Err(KernelError::from(ErrorKind::Memory(MemoryError::FrameTableExhausted)));
            };

            let owners = self.entry(candidate).owners.clone();
            let any_accessed = owners
                .iter()
                .any(|(pid, vaddr)| super::user_paging::is_accessed(*pid, *vaddr));

            if any_accessed {
                for (pid, vaddr) in &owners {
                    super::user_paging::clear_accessed(*pid, *vaddr);
                }
                self.order.push_back(candidate);
                continue;
            }

            let any_dirty = owners
                .iter()
                .any(|(pid, vaddr)| super::user_paging::is_dirty(*pid, *vaddr));
            for (pid, vaddr) in &owners {
                super::user_paging::clear_mapping(*pid, *vaddr);
            }

            let offset = PHYS_MEM_OFFSET.load(Ordering::Relaxed);
            let frame = self.entry_mut(candidate).phys.take().expect("candidate must be resident");
            let src = (offset + frame.start_address().as_u64()) as *const u8;

            let mmap_source = self.entry(candidate).mmap_source;
            if let Some(source) = mmap_source {
                if any_dirty {
                    super::supplemental::write_mmap_source(&source, src, 4096)?;
                }
            } else {
                // Out-of-swap has no recovery path: every other frame is pinned
                // or already evicted, and there is nowhere left to put this
                // page's contents. Continuing would hand the caller a frame
                // whose previous contents were silently discarded.
                let index = super::swap::SWAP
                    .lock()
                    .write_out(src)
                    .expect("out of swap space; no recovery path for eviction");
                self.entry_mut(candidate).swap_index = Some(index);
            }

            let mut allocator = BOOT_INFO_ALLOCATOR.lock();
            if let Some(a) = allocator.as_mut() {
                unsafe { a.deallocate_frame(frame) };
            }
            return Ok(());
        }
    }
}

lazy_static! {
    /// グローバルフレームテーブル
    pub static ref FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable::new());
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn fake_entry(phys_addr: u64, owners: Vec<(ProcessId, VirtAddr)>) -> FrameEntry {
        FrameEntry {
            phys: Some(PhysFrame::containing_address(PhysAddr::new(phys_addr))),
            swap_index: None,
            owners,
            writable: true,
            mmap_source: None,
        }
    }

    #[test]
    fn insert_entry_reuses_freed_slot_before_growing() {
        let mut table = FrameTable::new();
        let a = table.insert_entry(fake_entry(0x1000, Vec::new()));
        let _b = table.insert_entry(fake_entry(0x2000, Vec::new()));

        table.entries[a.0] = None;
        table.free_slots.push(a.0);

        let c = table.insert_entry(fake_entry(0x3000, Vec::new()));
        assert_eq!(c.0, a.0, "a freed slot should be reused before the slab grows");
    }

    #[test]
    fn kaddr_is_none_once_evicted() {
        let mut table = FrameTable::new();
        let resident = table.insert_entry(fake_entry(0x5000, Vec::new()));
        assert!(table.kaddr(resident).is_some());

        table.entry_mut(resident).phys = None;
        assert!(table.kaddr(resident).is_none());
    }

    #[test]
    #[should_panic(expected = "multi-owner")]
    fn free_panics_on_multi_owner_frame() {
        let mut table = FrameTable::new();
        let owners = alloc::vec![
            (ProcessId::new(101), VirtAddr::new(0x1000)),
            (ProcessId::new(102), VirtAddr::new(0x2000)),
        ];
        let handle = table.insert_entry(fake_entry(0x6000, owners));
        table.free(handle, ProcessId::new(101), VirtAddr::new(0x1000));
    }

    #[test]
    fn evict_one_on_empty_table_is_exhausted() {
        let mut table = FrameTable::new();
        let err = table.evict_one().expect_err("nothing to evict");
        assert_eq!(*err.kind(), ErrorKind::Memory(MemoryError::FrameTableExhausted));
    }

    #[test]
    fn get_user_page_fails_without_a_physical_allocator() {
        // No boot-time allocator has been installed in this test binary, and the
        // table starts empty, so this must fail cleanly rather than loop forever.
        let mut table = FrameTable::new();
        assert!(table.get_user_page(true, false).is_err());
    }
}

// src/kernel/mm/user_paging.rs
//! ユーザー空間アドレス帯の定数と、プロセスのページテーブルを
//! `x86_64::structures::paging::{OffsetPageTable, Mapper}` 越しに操作する
//! ためのヘルパー群。
//!
//! `kernel::mm::paging::PageMapping` と同じやり方でクレートの Mapper trait を
//! 直接借用する。accessed/dirty ビットの検査はハードウェアそのものに聞く
//! （`Mapper::translate`）ので、セカンドチャンス走査が別に状態を持つ必要はない。

use core::sync::atomic::Ordering;

use x86_64::structures::paging::mapper::{MapToError, Translate, TranslateResult};
use x86_64::structures::paging::{
    FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags,
    PhysFrame, Size4KiB,
};
use x86_64::registers::control::Cr3;
use x86_64::VirtAddr;

use crate::kernel::mm::allocator::BOOT_INFO_ALLOCATOR;
use crate::kernel::process::{ProcessId, PROCESS_TABLE};

use super::PHYS_MEM_OFFSET;

/// ユーザーコードセグメントの最小仮想アドレス（ゼロページを除く最初のページ境界の少し上）
pub const USER_CODE_BASE: u64 = 0x0000_0000_0040_0000;

/// ユーザースタックの天井（正準アドレス境界のすぐ下）。`PHYS_BASE` 相当。
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFFF_F000;

/// スタック予約領域の大きさ（ここまでは `exec` 時の単一ページから伸長してよい）
pub const USER_STACK_RESERVATION: u64 = 2 * 1024 * 1024;

/// PUSHA が esp の下に書き込みうる最大バイト数。スタック伸長ヒューリスティックで使う。
pub const STACK_FAULT_SLACK: u64 = 32;

fn phys_mem_offset() -> VirtAddr {
    VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed))
}

/// 指定したプロセスのページテーブルに対して `OffsetPageTable` を構築し、クロージャに渡す。
///
/// プロセスがテーブルに存在しない場合は `None` を返す。
fn with_process_mapper<R>(pid: ProcessId, f: impl FnOnce(&mut OffsetPageTable) -> R) -> Option<R> {
    let frame = {
        let table = PROCESS_TABLE.lock();
        table.get_process(pid)?.page_table_frame()
    };
    let offset = phys_mem_offset();
    let l4_ptr = (offset + frame.start_address().as_u64()).as_mut_ptr::<PageTable>();
    // SAFETY: `frame` was handed out by our own page-table allocator and is
    // reachable through the physical memory mapping established at boot.
    let l4 = unsafe { &mut *l4_ptr };
    let mut mapper = unsafe { OffsetPageTable::new(l4, offset) };
    Some(f(&mut mapper))
}

/// ページをフレームへマップする（すでにマップ済みならフラグを更新する）。
///
/// `add_owner`/`swap_in` から呼ばれ、該当プロセスのハードウェアページテーブルに
/// フレームをインストールする。
pub fn install_mapping(pid: ProcessId, vaddr: VirtAddr, frame: PhysFrame, writable: bool) -> bool {
    let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
    let Some(frame_allocator) = allocator_lock.as_mut() else {
        return false;
    };

    with_process_mapper(pid, |mapper| {
        let page = Page::<Size4KiB>::containing_address(vaddr);
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        // SAFETY: `frame` is owned by the frame table and not mapped elsewhere
        // with conflicting permissions.
        unsafe {
            match mapper.map_to(page, frame, flags, frame_allocator) {
                Ok(flush) => {
                    flush.flush();
                    true
                }
                Err(MapToError::PageAlreadyMapped(_)) => mapper
                    .update_flags(page, flags)
                    .map(|flush| flush.flush())
                    .is_ok(),
                Err(_) => false,
            }
        }
    })
    .unwrap_or(false)
}

/// ページのマッピングを取り除く。マップされていなければ何もしない。
pub fn clear_mapping(pid: ProcessId, vaddr: VirtAddr) {
    with_process_mapper(pid, |mapper| {
        let page = Page::<Size4KiB>::containing_address(vaddr);
        if let Ok((_, flush)) = mapper.unmap(page) {
            flush.flush();
        }
    });
}

fn page_flags(pid: ProcessId, vaddr: VirtAddr) -> Option<PageTableFlags> {
    with_process_mapper(pid, |mapper| match mapper.translate(vaddr) {
        TranslateResult::Mapped { flags, .. } => Some(flags),
        _ => None,
    })
    .flatten()
}

/// ハードウェアの accessed ビットを調べる。マップされていなければ `false`。
pub fn is_accessed(pid: ProcessId, vaddr: VirtAddr) -> bool {
    page_flags(pid, vaddr)
        .map(|f| f.contains(PageTableFlags::ACCESSED))
        .unwrap_or(false)
}

/// ハードウェアの accessed ビットを落とす。
pub fn clear_accessed(pid: ProcessId, vaddr: VirtAddr) {
    with_process_mapper(pid, |mapper| {
        if let TranslateResult::Mapped { flags, .. } = mapper.translate(vaddr) {
            let page = Page::<Size4KiB>::containing_address(vaddr);
            let new_flags = flags & !PageTableFlags::ACCESSED;
            let _ = mapper.update_flags(page, new_flags).map(|f| f.flush());
        }
    });
}

/// ハードウェアの dirty ビットを調べる。マップされていなければ `false`。
pub fn is_dirty(pid: ProcessId, vaddr: VirtAddr) -> bool {
    page_flags(pid, vaddr)
        .map(|f| f.contains(PageTableFlags::DIRTY))
        .unwrap_or(false)
}

/// 現在アクティブなページテーブルをもとに、ユーザー空間全体を複製した
/// 新しい PML4 フレームを作る。カーネル空間（エントリ 256-511）は共有コピー、
/// ユーザー空間（エントリ 0-255）はページ内容ごとの完全コピーになる。
///
/// # Safety
/// 呼び出し元は現在の CR3 が複製元として妥当であることを保証しなければならない。
pub unsafe fn duplicate_user_page_table<A>(
    frame_allocator: &mut A,
) -> Result<PhysFrame, &'static str>
where
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    let offset = phys_mem_offset();
    let (current_l4_frame, _) = Cr3::read();
    let current_l4: &PageTable =
        unsafe { &*(offset + current_l4_frame.start_address().as_u64()).as_ptr() };

    let new_l4_frame = frame_allocator.allocate_frame().ok_or("out of frames: L4")?;
    let new_l4: &mut PageTable =
        unsafe { &mut *(offset + new_l4_frame.start_address().as_u64()).as_mut_ptr() };
    new_l4.zero();
    for i in 256..512 {
        new_l4[i] = current_l4[i].clone();
    }

    for l4i in 0..256 {
        let l4e = &current_l4[l4i];
        if l4e.is_unused() {
            continue;
        }
        let cur_l3: &PageTable = unsafe { &*(offset + l4e.addr().as_u64()).as_ptr() };
        let new_l3_frame = frame_allocator.allocate_frame().ok_or("out of frames: L3")?;
        let new_l3: &mut PageTable =
            unsafe { &mut *(offset + new_l3_frame.start_address().as_u64()).as_mut_ptr() };
        new_l3.zero();
        new_l4[l4i].set_frame(new_l3_frame, l4e.flags());

        for l3i in 0..512 {
            let l3e = &cur_l3[l3i];
            if l3e.is_unused() {
                continue;
            }
            let cur_l2: &PageTable = unsafe { &*(offset + l3e.addr().as_u64()).as_ptr() };
            let new_l2_frame = frame_allocator.allocate_frame().ok_or("out of frames: L2")?;
            let new_l2: &mut PageTable =
                unsafe { &mut *(offset + new_l2_frame.start_address().as_u64()).as_mut_ptr() };
            new_l2.zero();
            new_l3[l3i].set_frame(new_l2_frame, l3e.flags());

            for l2i in 0..512 {
                let l2e = &cur_l2[l2i];
                if l2e.is_unused() {
                    continue;
                }
                let cur_l1: &PageTable = unsafe { &*(offset + l2e.addr().as_u64()).as_ptr() };
                let new_l1_frame = frame_allocator.allocate_frame().ok_or("out of frames: L1")?;
                let new_l1: &mut PageTable =
                    unsafe { &mut *(offset + new_l1_frame.start_address().as_u64()).as_mut_ptr() };
                new_l1.zero();
                new_l2[l2i].set_frame(new_l1_frame, l2e.flags());

                for l1i in 0..512 {
                    let l1e = &cur_l1[l1i];
                    if l1e.is_unused() {
                        continue;
                    }
                    let src_frame = l1e.frame().map_err(|_| "huge pages unsupported in fork")?;
                    let dst_frame = frame_allocator.allocate_frame().ok_or("out of frames: page")?;
                    let src_ptr = (offset + src_frame.start_address().as_u64()).as_ptr::<u8>();
                    let dst_ptr = (offset + dst_frame.start_address().as_u64()).as_mut_ptr::<u8>();
                    unsafe {
                        core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, 4096);
                    }
                    new_l1[l1i].set_frame(dst_frame, l1e.flags());
                }
            }
        }
    }

    Ok(new_l4_frame)
}

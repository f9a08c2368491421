// src/kernel/mm/page_fault.rs
//! ユーザー空間ページフォルトの解決。
//!
//! 補助ページテーブルを引き、常駐化・共有フレームの取得・スタック伸長のいずれかを
//! 行う。どれにも当てはまらなければ呼び出し元がプロセスを終了させる。

use x86_64::VirtAddr;

use crate::debug_println;
use crate::kernel::core::traits::FileSystem;
use crate::kernel::fs::ramfs::RAMFS;
use crate::kernel::process::ProcessId;

use super::share::ShareKey;
use super::{FRAME_TABLE, SHARE_TABLE};

/// ページフォルト解決の結果エラー
#[derive(Debug, Clone, Copy)]
pub enum PageFaultError {
    /// 補助ページテーブルにもスタック予約域にも当てはまらない不正アクセス
    InvalidAddress,
    /// フレーム確保・スワップ・ファイル読み込みが失敗した（メモリ不足など）
    OutOfMemory,
    /// 実行ファイルからの読み込みが `bytes_read` に満たなかった
    ShortRead,
}

/// フォルトしたアドレスがユーザースタック予約域（`PHYS_BASE` から 2 MiB 下まで）に
/// 収まっており、かつユーザー esp から高々 32 バイト下（PUSHA が届く範囲）に
/// あるかどうかを判定する。
fn looks_like_stack_growth(fault_addr: u64, user_esp: u64) -> bool {
    let stack_top = super::USER_STACK_TOP;
    let stack_bottom = stack_top.saturating_sub(super::user_paging::USER_STACK_RESERVATION);
    if fault_addr < stack_bottom || fault_addr >= stack_top {
        return false;
    }
    fault_addr + super::user_paging::STACK_FAULT_SLACK >= user_esp
}

/// ユーザー空間ページフォルトを解決する。
///
/// `pid` はフォルトしたプロセス、`fault_addr` はフォルトした仮想アドレス、
/// `user_esp` はフォルト時点でのユーザースタックポインタ（スタック伸長判定に使う）。
pub fn handle_user_page_fault(
    pid: ProcessId,
    fault_addr: VirtAddr,
    user_esp: u64,
) -> Result<(), PageFaultError> {
    let page_addr = VirtAddr::new(fault_addr.as_u64() & !0xFFF);
    debug_println!(
        "[PageFault] pid={} fault at {:#x} (page {:#x})",
        pid.as_u64(),
        fault_addr.as_u64(),
        page_addr.as_u64()
    );

    let existing = {
        let mut table = crate::kernel::process::PROCESS_TABLE.lock();
        let process = table.get_process_mut(pid).ok_or(PageFaultError::InvalidAddress)?;
        process.supplemental_mut().get(page_addr).cloned()
    };

    if let Some(entry) = existing {
        if let Some(handle) = entry.frame {
            FRAME_TABLE
                .lock()
                .swap_in(handle)
                .map_err(|_| PageFaultError::OutOfMemory)?;
            return Ok(());
        }

        if entry.read_only_exec {
            let source = entry.source.expect("read_only_exec entry always has a source");
            let key = ShareKey::new(&source);
            let fs = &*RAMFS;
            let handle = SHARE_TABLE
                .lock()
                .get_frame(key, pid, page_addr, fs, source.file)
                .map_err(|_| PageFaultError::OutOfMemory)?;

            let mut table = crate::kernel::process::PROCESS_TABLE.lock();
            let process = table.get_process_mut(pid).ok_or(PageFaultError::InvalidAddress)?;
            if let Some(entry) = process.supplemental_mut().get_mut(page_addr) {
                entry.frame = Some(handle);
            }
            return Ok(());
        }

        // Lazily-loaded ELF segment or mmap page: materialise a fresh frame and
        // populate it from the source file (if any).
        let handle = FRAME_TABLE
            .lock()
            .get_user_page(true, entry.writable)
            .map_err(|_| PageFaultError::OutOfMemory)?;
        if entry.mmap {
            if let Some(source) = entry.source {
                FRAME_TABLE.lock().set_mmap_source(handle, source);
            }
        }
        FRAME_TABLE
            .lock()
            .add_owner(handle, pid, page_addr, entry.writable)
            .map_err(|_| PageFaultError::OutOfMemory)?;

        if let Some(source) = entry.source {
            let kaddr = FRAME_TABLE.lock().kaddr(handle).ok_or(PageFaultError::OutOfMemory)?;
            let fs = &*RAMFS;
            let saved = fs.tell(source.file);
            fs.seek(source.file, source.offset);
            let buf = unsafe {
                core::slice::from_raw_parts_mut(kaddr as *mut u8, source.bytes_read as usize)
            };
            let n = fs.read(source.file, buf).map_err(|_| PageFaultError::ShortRead)?;
            fs.seek(source.file, saved);
            if (n as u32) < source.bytes_read {
                return Err(PageFaultError::ShortRead);
            }
        }

        let mut table = crate::kernel::process::PROCESS_TABLE.lock();
        let process = table.get_process_mut(pid).ok_or(PageFaultError::InvalidAddress)?;
        if let Some(entry) = process.supplemental_mut().get_mut(page_addr) {
            entry.frame = Some(handle);
        }
        return Ok(());
    }

    if looks_like_stack_growth(page_addr.as_u64(), user_esp) {
        let mut table = crate::kernel::process::PROCESS_TABLE.lock();
        let process = table.get_process_mut(pid).ok_or(PageFaultError::InvalidAddress)?;
        process
            .supplemental_mut()
            .allocate_stack_page(page_addr)
            .map_err(|_| PageFaultError::OutOfMemory)?;
        return Ok(());
    }

    debug_println!("[PageFault] pid={} invalid address {:#x}", pid.as_u64(), fault_addr.as_u64());
    Err(PageFaultError::InvalidAddress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_growth_is_recognised_within_reservation_and_slack() {
        let esp = super::super::USER_STACK_TOP - 4096;
        assert!(looks_like_stack_growth(esp - 16, esp));
    }

    #[test]
    fn stack_growth_rejects_addresses_below_the_reservation() {
        let reservation_floor = super::super::USER_STACK_TOP - super::super::user_paging::USER_STACK_RESERVATION;
        assert!(!looks_like_stack_growth(reservation_floor - 4096, reservation_floor));
    }

    #[test]
    fn stack_growth_rejects_addresses_at_or_above_the_stack_top() {
        assert!(!looks_like_stack_growth(super::super::USER_STACK_TOP, super::super::USER_STACK_TOP - 16));
    }

    #[test]
    fn stack_growth_rejects_addresses_far_below_esp() {
        let esp = super::super::USER_STACK_TOP - 4096;
        assert!(!looks_like_stack_growth(esp - 4096, esp));
    }

    #[test]
    fn unknown_pid_is_reported_as_an_invalid_address() {
        // PID 0 is reserved for the kernel and is never handed out by
        // `ProcessTable::allocate_pid`, so it is guaranteed absent here.
        let result = handle_user_page_fault(ProcessId::new(0), VirtAddr::new(0x1000), 0x1000);
        assert!(matches!(result, Err(PageFaultError::InvalidAddress)));
    }
}

// src/kernel/mm/swap.rs
//! スワップスロットのビットマップアロケータ
//!
//! `kernel::core::traits::BlockDevice` の上に、ページ単位のスロットを
//! 割り当てる単純なビットマップを重ねる。1 スロットは `PAGE_SIZE / セクタサイズ`
//! 個のセクタからなる。

use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::kernel::core::result::{ErrorKind, KernelError, MemoryError};
use crate::kernel::core::traits::{BlockDevice, Device};
use crate::kernel::core::KernelResult;

const PAGE_SIZE: usize = 4096;

/// スワップ領域内のスロット番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapIndex(usize);

/// テスト・初期ブート用のメモリ上ブロックデバイス
///
/// 実ディスクドライバがまだ存在しないため、スワップ裏面として使う。
/// セクタサイズは 512 バイト固定。
pub struct RamBlockDevice {
    sector_size: usize,
    sectors: Vec<u8>,
}

impl RamBlockDevice {
    #[must_use]
    pub fn new(total_sectors: usize, sector_size: usize) -> Self {
        Self {
            sector_size,
            sectors: vec![0u8; total_sectors * sector_size],
        }
    }
}

impl Device for RamBlockDevice {
    fn name(&self) -> &str {
        "ram-swap"
    }

    fn init(&mut self) -> KernelResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> KernelResult<()> {
        self.sectors.fill(0);
        Ok(())
    }
}

impl BlockDevice for RamBlockDevice {
    fn block_size(&self) -> usize {
        self.sector_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let start = block as usize * self.sector_size;
        let end = start + self.sector_size.min(buf.len());
        buf[..end - start].copy_from_slice(&self.sectors[start..end]);
        Ok(end - start)
    }

    fn write_block(&mut self, block: u64, buf: &[u8]) -> KernelResult<usize> {
        let start = block as usize * self.sector_size;
        let end = start + self.sector_size.min(buf.len());
        self.sectors[start..end].copy_from_slice(&buf[..end - start]);
        Ok(end - start)
    }

    fn total_blocks(&self) -> u64 {
        (self.sectors.len() / self.sector_size) as u64
    }
}

/// ページサイズ単位のスロットを管理するビットマップアロケータ
pub struct SwapAllocator<D: BlockDevice> {
    device: D,
    used: Vec<bool>,
    sectors_per_slot: usize,
}

impl<D: BlockDevice> SwapAllocator<D> {
    pub fn new(device: D) -> Self {
        let sector_size = device.block_size().max(1);
        let sectors_per_slot = (PAGE_SIZE / sector_size).max(1);
        let slot_count = (device.total_blocks() as usize) / sectors_per_slot;
        Self {
            device,
            used: vec![false; slot_count],
            sectors_per_slot,
        }
    }

    /// `kpage` の `PAGE_SIZE` バイトを最初に見つかった空きスロットへ書き出す。
    /// 空きスロットがない場合は回復不能なエラーとして返す（呼び出し元は panic する）。
    pub fn write_out(&mut self, kpage: *const u8) -> KernelResult<SwapIndex> {
        let _lock_order = crate::sync::acquire_lock(crate::sync::LockId::Swap);
        let index = self
            .used
            .iter()
            .position(|used| !used)
            .ok_or_else(|| KernelError::from(ErrorKind::Memory(MemoryError::SwapExhausted)))?;
        self.used[index] = true;

        let sector_size = self.device.block_size();
        for s in 0..self.sectors_per_slot {
            // SAFETY: caller guarantees `kpage` points at a full, readable page.
            let buf = unsafe {
                core::slice::from_raw_parts(kpage.add(s * sector_size), sector_size)
            };
            let sector = (index * self.sectors_per_slot + s) as u64;
            self.device
                .write_block(sector, buf)
                .map_err(|_| KernelError::from(ErrorKind::Memory(MemoryError::SwapExhausted)))?;
        }
        Ok(SwapIndex(index))
    }

    /// スロット `index` の内容を `kpage` へ読み込み、スロットを解放する。
    pub fn read_in(&mut self, index: SwapIndex, kpage: *mut u8) -> KernelResult<()> {
        let _lock_order = crate::sync::acquire_lock(crate::sync::LockId::Swap);
        let sector_size = self.device.block_size();
        for s in 0..self.sectors_per_slot {
            // SAFETY: caller guarantees `kpage` points at a full, writable page.
            let buf = unsafe {
                core::slice::from_raw_parts_mut(kpage.add(s * sector_size), sector_size)
            };
            let sector = (index.0 * self.sectors_per_slot + s) as u64;
            self.device.read_block(sector, buf).map_err(|_| {
                KernelError::from(ErrorKind::Memory(MemoryError::InvalidPageFault))
            })?;
        }
        self.used[index.0] = false;
        Ok(())
    }

    /// 内容を読まずにスロットを解放する。
    pub fn free(&mut self, index: SwapIndex) {
        self.used[index.0] = false;
    }
}

lazy_static! {
    /// グローバルスワップアロケータ。起動時は 4096 スロット分の RAM 裏面で初期化される。
    pub static ref SWAP: Mutex<SwapAllocator<RamBlockDevice>> =
        Mutex::new(SwapAllocator::new(RamBlockDevice::new(4096 * 8, 512)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut swap = SwapAllocator::new(RamBlockDevice::new(64, 512));
        let page_out = [0xABu8; PAGE_SIZE];
        let index = swap.write_out(page_out.as_ptr()).expect("write_out");

        let mut page_in = [0u8; PAGE_SIZE];
        swap.read_in(index, page_in.as_mut_ptr()).expect("read_in");
        assert_eq!(page_out, page_in);
    }

    #[test]
    fn slots_are_reused_after_free() {
        let mut swap = SwapAllocator::new(RamBlockDevice::new(8, 512));
        let page = [0u8; PAGE_SIZE];
        let first = swap.write_out(page.as_ptr()).expect("first write");
        swap.free(first);
        let second = swap.write_out(page.as_ptr()).expect("second write");
        assert_eq!(first, second);
    }
}

// src/kernel/mm/mod.rs
//! メモリ管理モジュール

pub mod allocator;
pub mod frame;
pub mod page_fault;
pub mod paging;
pub mod share;
pub mod supplemental;
pub mod swap;
pub mod types;
pub mod user_paging;

use core::sync::atomic::AtomicU64;

pub use allocator::{LinkedListAllocator, LockedHeap};
pub use frame::{BootInfoFrameAllocator, FrameHandle, FrameTable, FRAME_TABLE};
pub use page_fault::{handle_user_page_fault, PageFaultError};
pub use share::{ShareKey, ShareTable, SHARE_TABLE};
pub use supplemental::{PageEntry, PageSource, SupplementalPageTable};
pub use swap::{SwapAllocator, SwapIndex};
pub use types::{LayoutSize, PhysAddr, VirtAddr};
pub use user_paging::{USER_CODE_BASE, USER_STACK_RESERVATION, USER_STACK_TOP};

/// ブートローダが `map_physical_memory` で全物理メモリをマップした際の
/// オフセット仮想アドレス。`kernel_main` がブート処理の最初期に一度だけ設定する。
pub static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

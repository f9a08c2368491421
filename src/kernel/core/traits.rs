// src/kernel/core/traits.rs
//! カーネルコア trait 定義

use super::types::*;
use super::result::*;
// use alloc::boxed::Box; // Phase 4 で有効化

/// デバイス抽象化の基本 trait
/// 
/// すべてのデバイスドライバはこの trait を実装します。
pub trait Device {
    /// デバイス名を取得
    fn name(&self) -> &str;
    
    /// デバイスを初期化
    fn init(&mut self) -> KernelResult<()>;
    
    /// デバイスをリセット
    fn reset(&mut self) -> KernelResult<()>;
    
    /// デバイスが利用可能か確認
    fn is_available(&self) -> bool {
        true
    }
}

/// キャラクタデバイス trait（シリアル、VGA など）
/// 
/// バイト単位で読み書きするデバイス用。
pub trait CharDevice: Device {
    /// 1バイト読み取り（ノンブロッキング）
    fn read_byte(&self) -> KernelResult<Option<u8>>;
    
    /// 1バイト書き込み
    fn write_byte(&mut self, byte: u8) -> KernelResult<()>;
    
    /// バッファを書き込み
    fn write_bytes(&mut self, buf: &[u8]) -> KernelResult<usize> {
        for &byte in buf.iter() {
            self.write_byte(byte)?;
        }
        Ok(buf.len())
    }
}

/// ブロックデバイス trait（ストレージなど）
/// 
/// 固定サイズブロック単位で読み書きするデバイス用。
pub trait BlockDevice: Device {
    /// ブロックサイズを取得（バイト単位）
    fn block_size(&self) -> usize;
    
    /// ブロックを読み取り
    fn read_block(&self, block: u64, buf: &mut [u8]) -> KernelResult<usize>;
    
    /// ブロックを書き込み
    fn write_block(&mut self, block: u64, buf: &[u8]) -> KernelResult<usize>;
    
    /// デバイスの総ブロック数
    fn total_blocks(&self) -> u64 {
        0 // デフォルト実装
    }
}

/// タスク抽象化
/// 
/// スケジューラで管理される実行単位。
/// タスクの実行状態は外部（Scheduler）が管理します。
pub trait Task {
    /// タスク ID を取得
    fn id(&self) -> TaskId;
    
    /// 優先度を取得
    fn priority(&self) -> Priority;
    
    /// タスク名を取得
    fn name(&self) -> &str {
        "unnamed"
    }
    
    /// 現在の実行状態を取得
    fn state(&self) -> TaskState;
}

/// タスク実行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// 実行可能（スケジュール待ち）
    Ready,
    /// 現在実行中
    Running,
    /// ブロック中（I/O待ちなど）
    Blocked,
    /// 終了済み
    Terminated,
}

/// ファイルの不変な identity（inode に相当）
///
/// share table のキーの一部として使う。同じファイルを複数回 `open` しても
/// 同じ `InodeId` が返ることが要件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(pub u64);

/// 開いているファイルのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// ファイルシステム trait（外部コラボレータ）
///
/// 単一のグローバルロックの下で動作する、バイトアドレス指定可能な
/// ファイルオブジェクトの集合として扱う。実装はこのロックを内部に
/// 持つか、呼び出し側（`kernel::fs`）が別途直列化する。
pub trait FileSystem: Send + Sync {
    /// 名前でファイルを開く
    fn open(&self, name: &str) -> KernelResult<FileHandle>;

    /// 新規ファイルを作成する
    fn create(&self, name: &str, initial_size: usize) -> KernelResult<()>;

    /// ファイルを削除する
    fn remove(&self, name: &str) -> KernelResult<()>;

    /// ハンドルを閉じる
    fn close(&self, handle: FileHandle);

    /// 現在のカーソル位置から読み取る
    fn read(&self, handle: FileHandle, buf: &mut [u8]) -> KernelResult<usize>;

    /// 現在のカーソル位置に書き込む
    fn write(&self, handle: FileHandle, buf: &[u8]) -> KernelResult<usize>;

    /// カーソルを絶対位置に移動する
    fn seek(&self, handle: FileHandle, pos: u64);

    /// 現在のカーソル位置を取得する
    fn tell(&self, handle: FileHandle) -> u64;

    /// ファイル長を取得する
    fn length(&self, handle: FileHandle) -> u64;

    /// 同じファイルを独立したカーソルで開き直す
    fn reopen(&self, handle: FileHandle) -> KernelResult<FileHandle>;

    /// このハンドル以降の書き込みを禁止する（実行ファイル用）
    fn deny_write(&self, handle: FileHandle);

    /// ハンドルの不変な identity（inode 相当）を取得する
    fn inode_of(&self, handle: FileHandle) -> InodeId;
}

/// ハードウェアページテーブル trait（外部コラボレータ）
///
/// `x86_64::structures::paging::{OffsetPageTable, Mapper}` 相当の操作を
/// プロセスのアドレス空間に対して行うための抽象。具体実装は
/// `kernel::mm::paging` にある。
pub trait HardwarePageTable {
    /// ページを物理フレームへマップする
    ///
    /// # Safety
    /// 呼び出し元は `kaddr` が有効な物理フレームであることを保証する必要がある。
    unsafe fn map(&mut self, vaddr: usize, kaddr: usize, writable: bool) -> bool;

    /// ページのマッピングを解除する
    fn unmap(&mut self, vaddr: usize);

    /// ページがマップされている物理アドレスを調べる
    fn lookup(&self, vaddr: usize) -> Option<usize>;

    /// ハードウェアの accessed ビットを調べる
    fn is_accessed(&self, vaddr: usize) -> bool;

    /// ハードウェアの accessed ビットを設定する
    fn set_accessed(&mut self, vaddr: usize, value: bool);

    /// ハードウェアの dirty ビットを調べる
    fn is_dirty(&self, vaddr: usize) -> bool;

    /// このページテーブルを有効化する（CR3 ロードに相当）
    ///
    /// # Safety
    /// アドレス空間の切り替えはマルチコアや割り込みコンテキストに影響するため、
    /// 呼び出し元が正しいタイミングで行う必要がある。
    unsafe fn activate(&self);
}

/// スケジューラ trait
/// 
/// タスクのスケジューリングとコンテキストスイッチを管理。
pub trait Scheduler {
    /// 次に実行するタスクを選択
    fn schedule(&mut self) -> Option<TaskId>;
    
    /// 指定されたタスクにスイッチ
    fn switch_to(&mut self, id: TaskId) -> KernelResult<()>;
    
    // /// タスクを追加 (Phase 4 で有効化)
    // fn add_task(&mut self, task: Box<dyn Task>) -> KernelResult<TaskId>;
    
    /// タスクを削除
    fn remove_task(&mut self, id: TaskId) -> KernelResult<()>;
    
    /// タスク数を取得
    fn task_count(&self) -> usize;
    
    /// タスクの状態を変更
    fn set_task_state(&mut self, id: TaskId, state: TaskState) -> KernelResult<()>;
}

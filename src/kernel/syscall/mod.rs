// src/kernel/syscall/mod.rs
//! System call implementation module
//!
//! This module provides the actual implementations of system calls
//! and the dispatch mechanism.

use crate::arch::Cpu;
use crate::debug_println;

use crate::kernel::core::traits::{CharDevice as _, FileHandle, FileSystem};
use crate::kernel::fs::ramfs::{RamFileDescriptor, RAMFS};
use crate::kernel::mm::{PageEntry, PageSource};
use crate::kernel::process::{MmapRegion, PROCESS_TABLE};

/// Maximum length for sys_write (1MB)
const MAX_WRITE_LEN: u64 = 1024 * 1024;

/// Longest path/command-line string we'll copy out of user space in one go.
const MAX_STRING_LEN: usize = 512;

const PAGE_SIZE: u64 = 4096;

/// Check if an address is in user space
///
/// User space: 0x0000_0000_0000_0000 ~ 0x0000_7FFF_FFFF_FFFF
/// Kernel space: 0xFFFF_8000_0000_0000 ~ 0xFFFF_FFFF_FFFF_FFFF
#[inline]
fn is_user_address(addr: u64) -> bool {
    addr < 0x0000_8000_0000_0000
}

/// Check if a memory range is in user space
#[inline]
fn is_user_range(addr: u64, len: u64) -> bool {
    let Some(end) = addr.checked_add(len) else {
        return false;
    };
    is_user_address(addr) && is_user_address(end.saturating_sub(1))
}

/// Copies a NUL-terminated string out of user space into a kernel buffer.
/// Rejects strings that run past `MAX_STRING_LEN` or off the end of user space.
fn read_user_cstr(ptr: u64) -> Option<alloc::string::String> {
    if ptr == 0 || !is_user_address(ptr) {
        return None;
    }
    let mut bytes = alloc::vec::Vec::with_capacity(64);
    for i in 0..MAX_STRING_LEN as u64 {
        let addr = ptr.checked_add(i)?;
        if !is_user_address(addr) {
            return None;
        }
        let byte = unsafe { *(addr as *const u8) };
        if byte == 0 {
            return alloc::string::String::from_utf8(bytes).ok();
        }
        bytes.push(byte);
    }
    None
}

/// System call result type
pub type SyscallResult = i64;

/// Success code
pub const SUCCESS: SyscallResult = 0;

/// Error codes (Linux-compatible)
pub const EPERM: SyscallResult = -1; // Operation not permitted
pub const ENOENT: SyscallResult = -2; // No such file or directory
pub const ESRCH: SyscallResult = -3; // No such process
pub const EINTR: SyscallResult = -4; // Interrupted system call
pub const EIO: SyscallResult = -5; // I/O error
pub const EBADF: SyscallResult = -9; // Bad file descriptor
pub const ECHILD: SyscallResult = -10; // No child processes
pub const EAGAIN: SyscallResult = -11; // Try again
pub const ENOMEM: SyscallResult = -12; // Out of memory
pub const EFAULT: SyscallResult = -14; // Bad address (invalid pointer)
pub const EEXIST: SyscallResult = -17; // File exists
pub const EINVAL: SyscallResult = -22; // Invalid argument
pub const EPIPE: SyscallResult = -32; // Broken pipe
pub const ENOSYS: SyscallResult = -38; // Function not implemented

/// sys_halt - Power off the machine
pub fn sys_halt(_a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    debug_println!("[SYSCALL] halt");
    loop {
        crate::arch::ArchCpu::halt();
    }
}

/// sys_exit - Exit current process with the given status code
pub fn sys_exit(code: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    use crate::kernel::process::{schedule_next, terminate_process};

    let pid = PROCESS_TABLE.lock().current_process().map(|p| p.pid());
    if let Some(pid) = pid {
        terminate_process(pid, code as i32);
        schedule_next();
    }

    loop {
        crate::arch::ArchCpu::halt();
    }
}

/// sys_exec - Start a new process running the named executable, returning its
/// pid (or -1 if the executable could not be loaded).
pub fn sys_exec(cmdline_ptr: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    let Some(cmdline) = read_user_cstr(cmdline_ptr) else {
        return EFAULT;
    };
    match crate::kernel::process::lifecycle::spawn_process(&cmdline) {
        Ok(pid) => pid.as_u64() as SyscallResult,
        Err(e) => {
            debug_println!("[SYSCALL] exec('{}') failed: {:?}", cmdline, e);
            EPERM
        }
    }
}

/// sys_wait - Wait for the specific child `tid` to terminate, reaping it and
/// returning its exit status. A `tid` that is not currently a child of the
/// caller (never spawned, or already reaped by an earlier `wait`) returns -1
/// immediately rather than blocking.
pub fn sys_wait(tid: u64, status_ptr: u64, _options: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    use crate::kernel::process::{schedule_next, ProcessId, ProcessState};

    let child_pid = ProcessId::new(tid);

    loop {
        let result = {
            let mut table = PROCESS_TABLE.lock();
            let Some(current_pid) = table.current_process().map(|p| p.pid()) else {
                return ESRCH;
            };

            if let Some(exit_code) = table.find_terminated_child(current_pid, child_pid) {
                if status_ptr != 0 && is_user_address(status_ptr) && is_user_range(status_ptr, 4) {
                    unsafe { *(status_ptr as *mut i32) = exit_code };
                }
                table.remove_process(child_pid);
                Ok(exit_code as SyscallResult)
            } else if table.has_child(current_pid, child_pid) {
                if let Some(current) = table.current_process_mut() {
                    current.set_state(ProcessState::Blocked);
                }
                Err(0)
            } else {
                Err(-1)
            }
        };

        match result {
            Ok(status) => return status,
            Err(0) => schedule_next(),
            Err(e) => return e,
        }
    }
}

/// sys_create - Create a new file with the given initial size
pub fn sys_create(name_ptr: u64, initial_size: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    let Some(name) = read_user_cstr(name_ptr) else {
        return EFAULT;
    };
    match RAMFS.create(&name, initial_size as usize) {
        Ok(()) => SUCCESS,
        Err(_) => EEXIST,
    }
}

/// sys_remove - Remove a file by name
pub fn sys_remove(name_ptr: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    let Some(name) = read_user_cstr(name_ptr) else {
        return EFAULT;
    };
    match RAMFS.remove(&name) {
        Ok(()) => SUCCESS,
        Err(_) => ENOENT,
    }
}

/// sys_open - Open a file, returning a process-local file descriptor
pub fn sys_open(name_ptr: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    let Some(name) = read_user_cstr(name_ptr) else {
        return EFAULT;
    };
    let handle = match RAMFS.open(&name) {
        Ok(h) => h,
        Err(_) => return ENOENT,
    };

    let mut table = PROCESS_TABLE.lock();
    let Some(process) = table.current_process_mut() else {
        return ESRCH;
    };
    let fd = process.add_file_descriptor(alloc::sync::Arc::new(spin::Mutex::new(RamFileDescriptor { handle })));
    fd as SyscallResult
}

/// Looks up the RAMFS handle backing a process-local fd, if any (pipes have
/// none).
fn ramfs_handle_of(fd: u64) -> Option<FileHandle> {
    let table = PROCESS_TABLE.lock();
    let process = table.current_process()?;
    let descriptor = process.get_file_descriptor(fd)?;
    descriptor.lock().ramfs_handle()
}

/// sys_filesize - Get the length of an open file
pub fn sys_filesize(fd: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    match ramfs_handle_of(fd) {
        Some(handle) => RAMFS.length(handle) as SyscallResult,
        None => EBADF,
    }
}

/// sys_read - Read from file descriptor
///
/// Arguments:
/// - arg1: fd (file descriptor)
/// - arg2: buffer pointer
/// - arg3: length
pub fn sys_read(fd: u64, buf: u64, len: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    if fd == 0 {
        debug_println!("[SYSCALL] sys_read from stdin not implemented yet");
        return ENOSYS;
    }

    let table = PROCESS_TABLE.lock();
    let Some(process) = table.current_process() else {
        return ESRCH;
    };
    let Some(fd_arc) = process.get_file_descriptor(fd) else {
        return EBADF;
    };
    drop(table);

    if buf == 0 || !is_user_address(buf) || !is_user_range(buf, len) {
        return EFAULT;
    }

    let slice = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len as usize) };
    let mut fd_lock = fd_arc.lock();
    match fd_lock.read(slice) {
        Ok(read) => read as SyscallResult,
        Err(crate::kernel::fs::FileError::BrokenPipe) => 0,
        Err(crate::kernel::fs::FileError::WouldBlock) => EAGAIN,
        Err(_) => EIO,
    }
}

/// sys_write - Write to file descriptor
///
/// Arguments:
/// - arg1: fd (file descriptor)
/// - arg2: buffer pointer
/// - arg3: length
pub fn sys_write(fd: u64, buf: u64, len: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    if fd == 1 || fd == 2 {
        if buf == 0 || !is_user_address(buf) {
            debug_println!("[SYSCALL] sys_write: invalid buffer address 0x{:x}", buf);
            return EFAULT;
        }
        if len > MAX_WRITE_LEN {
            debug_println!("[SYSCALL] sys_write: length too large ({})", len);
            return EINVAL;
        }
        if !is_user_range(buf, len) {
            debug_println!("[SYSCALL] sys_write: buffer range crosses user/kernel boundary");
            return EFAULT;
        }

        let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, len as usize) };
        use crate::kernel::driver::serial::SERIAL1;
        if let Some(lock) = SERIAL1.get() {
            if let Some(mut serial) = lock.try_lock() {
                for &byte in slice {
                    let _ = serial.write_byte(byte);
                }
            }
        }
        return len as SyscallResult;
    }

    let table = PROCESS_TABLE.lock();
    let Some(process) = table.current_process() else {
        return ESRCH;
    };
    let Some(fd_arc) = process.get_file_descriptor(fd) else {
        return EBADF;
    };
    drop(table);

    if buf == 0 || !is_user_address(buf) || !is_user_range(buf, len) {
        return EFAULT;
    }

    let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, len as usize) };
    let mut fd_lock = fd_arc.lock();
    match fd_lock.write(slice) {
        Ok(written) => written as SyscallResult,
        Err(crate::kernel::fs::FileError::BrokenPipe) => EPIPE,
        Err(crate::kernel::fs::FileError::WouldBlock) => EAGAIN,
        Err(_) => EIO,
    }
}

/// sys_seek - Move the cursor of an open file descriptor
pub fn sys_seek(fd: u64, pos: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    match ramfs_handle_of(fd) {
        Some(handle) => {
            RAMFS.seek(handle, pos);
            SUCCESS
        }
        None => EBADF,
    }
}

/// sys_tell - Report the cursor position of an open file descriptor
pub fn sys_tell(fd: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    match ramfs_handle_of(fd) {
        Some(handle) => RAMFS.tell(handle) as SyscallResult,
        None => EBADF,
    }
}

/// sys_close - Close a file descriptor
pub fn sys_close(fd: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    let mut table = PROCESS_TABLE.lock();
    let Some(process) = table.current_process_mut() else {
        return ESRCH;
    };
    process.close_file_descriptor(fd);
    SUCCESS
}

/// sys_getpid - Get process ID
pub fn sys_getpid(_a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    crate::kernel::process::current_pid().map_or(ESRCH, |p| p.as_u64() as SyscallResult)
}

/// sys_alloc - kernel-extension heap allocation (beyond the 15-syscall surface)
pub fn sys_alloc(size: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    debug_println!("[SYSCALL] sys_alloc not implemented yet (requested {} bytes)", size);
    ENOSYS
}

/// sys_dealloc - kernel-extension heap deallocation (beyond the 15-syscall surface)
pub fn sys_dealloc(ptr: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    debug_println!("[SYSCALL] sys_dealloc not implemented yet (ptr=0x{:x})", ptr);
    ENOSYS
}

/// sys_fork - kernel-extension POSIX-style fork (beyond the 15-syscall surface)
pub fn sys_fork(_a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    match crate::kernel::process::lifecycle::fork_process() {
        Ok(pid) => pid.as_u64() as SyscallResult,
        Err(_) => ENOMEM,
    }
}

/// sys_pipe - kernel-extension pipe creation (beyond the 15-syscall surface)
pub fn sys_pipe(pipefd: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    use crate::kernel::fs::pipe::{Pipe, PipeReader, PipeWriter};
    use alloc::sync::Arc;
    use spin::Mutex;

    if !is_user_address(pipefd) || !is_user_range(pipefd, 16) {
        return EFAULT;
    }

    let pipe = Arc::new(Mutex::new(Pipe::new()));
    let reader = Arc::new(Mutex::new(PipeReader { pipe: pipe.clone() }));
    let writer = Arc::new(Mutex::new(PipeWriter { pipe }));

    let mut table = PROCESS_TABLE.lock();
    let Some(process) = table.current_process_mut() else {
        return ESRCH;
    };

    let read_fd = process.add_file_descriptor(reader);
    let write_fd = process.add_file_descriptor(writer);

    unsafe {
        let pipefd_ptr = pipefd as *mut u64;
        *pipefd_ptr = read_fd;
        *pipefd_ptr.add(1) = write_fd;
    }

    SUCCESS
}

/// sys_mmap - Map an open file's contents into the calling process's address
/// space. Pages are registered lazily in the supplemental page table; nothing
/// is read until the first fault.
pub fn sys_mmap(addr: u64, len: u64, _prot: u64, _flags: u64, fd: u64, offset: u64) -> SyscallResult {
    if len == 0 || addr == 0 || addr % PAGE_SIZE != 0 {
        return EINVAL;
    }

    let Some(backing) = ramfs_handle_of(fd) else {
        return EBADF;
    };

    let mut table = PROCESS_TABLE.lock();
    let Some(process) = table.current_process_mut() else {
        return ESRCH;
    };

    // Reopen through RAMFS directly so the mapping gets its own cursor,
    // independent of the fd's.
    let handle = match RAMFS.reopen(backing) {
        Ok(h) => h,
        Err(_) => return EBADF,
    };
    let inode = RAMFS.inode_of(handle);
    let length = RAMFS.length(handle);
    if offset >= length && length != 0 {
        RAMFS.close(handle);
        return EINVAL;
    }

    let len_aligned = (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let num_pages = (len_aligned / PAGE_SIZE) as usize;
    let start = x86_64::VirtAddr::new(addr);
    let end = addr + len_aligned;

    let stack_low = crate::kernel::mm::USER_STACK_TOP - crate::kernel::mm::USER_STACK_RESERVATION;
    if addr < crate::kernel::mm::USER_STACK_TOP && end > stack_low {
        RAMFS.close(handle);
        return EINVAL;
    }

    for i in 0..num_pages {
        let page_vaddr = start + (i as u64) * PAGE_SIZE;
        if process.supplemental().get(page_vaddr).is_some() {
            RAMFS.close(handle);
            return EINVAL;
        }
    }

    for i in 0..num_pages {
        let page_vaddr = start + (i as u64) * PAGE_SIZE;
        let file_pos = offset + (i as u64) * PAGE_SIZE;
        let remaining = length.saturating_sub(file_pos);
        let bytes_read = remaining.min(PAGE_SIZE) as u32;
        let source = PageSource {
            file: handle,
            inode,
            offset: file_pos,
            bytes_read,
            zero_bytes: (PAGE_SIZE as u32).saturating_sub(bytes_read),
        };
        process
            .supplemental_mut()
            .insert(PageEntry::from_mmap(page_vaddr, source));
    }

    process.add_mmap_region(MmapRegion {
        start,
        page_count: num_pages,
        file: handle,
    });

    start.as_u64() as SyscallResult
}

/// sys_munmap - Unmap a previously `mmap`'d region, writing back any dirty
/// pages to the backing file first.
pub fn sys_munmap(addr: u64, _len: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> SyscallResult {
    let start = x86_64::VirtAddr::new(addr);
    let mut table = PROCESS_TABLE.lock();
    let Some(process) = table.current_process_mut() else {
        return ESRCH;
    };

    let Some(region) = process.remove_mmap_region(start) else {
        return EINVAL;
    };

    for i in 0..region.page_count {
        let page_vaddr = start + (i as u64) * PAGE_SIZE;
        process.supplemental_mut().remove(page_vaddr);
    }

    // Dirty-page writeback already ran inside supplemental_mut().remove().
    RAMFS.close(region.file);
    SUCCESS
}

/// Syscall handler function type
type SyscallHandler = fn(u64, u64, u64, u64, u64, u64) -> SyscallResult;

/// Syscall dispatch table, numbered per the documented 15-syscall surface
/// (0-14); extensions beyond that surface (fork/pipe/getpid/alloc/dealloc)
/// are appended afterwards rather than interleaved.
static SYSCALL_TABLE: &[SyscallHandler] = &[
    sys_halt,     // 0
    sys_exit,     // 1
    sys_exec,     // 2
    sys_wait,     // 3
    sys_create,   // 4
    sys_remove,   // 5
    sys_open,     // 6
    sys_filesize, // 7
    sys_read,     // 8
    sys_write,    // 9
    sys_seek,     // 10
    sys_tell,     // 11
    sys_close,    // 12
    sys_mmap,     // 13
    sys_munmap,   // 14
    sys_getpid,   // 15 (extension)
    sys_alloc,    // 16 (extension)
    sys_dealloc,  // 17 (extension)
    sys_fork,     // 18 (extension)
    sys_pipe,     // 19 (extension)
];

/// Dispatch a syscall to its handler
pub fn dispatch(
    syscall_num: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    arg6: u64,
) -> SyscallResult {
    let num = syscall_num as usize;

    if num >= SYSCALL_TABLE.len() {
        debug_println!("[SYSCALL] Invalid syscall number: {}", syscall_num);
        return ENOSYS;
    }

    debug_println!(
        "[SYSCALL] Dispatching syscall {} with args=({}, {}, {}, {}, {}, {})",
        syscall_num, arg1, arg2, arg3, arg4, arg5, arg6
    );

    let handler = SYSCALL_TABLE[num];
    handler(arg1, arg2, arg3, arg4, arg5, arg6)
}

/// Test syscall mechanism from kernel space
///
/// This is a simple test that can be called from kernel initialization
/// to verify that syscalls work correctly before jumping to user mode.
///
/// # Safety
/// This function simulates syscalls but runs in kernel space (Ring 0).
/// It's safe to call during boot before user mode is active.
#[cfg(debug_assertions)]
#[allow(dead_code)]
pub fn test_syscall_mechanism() {
    debug_println!("\n=== Testing Syscall Mechanism ===");

    debug_println!("Test 1: sys_getpid");
    let pid = dispatch(15, 0, 0, 0, 0, 0, 0);
    debug_println!("  Result: PID = {}", pid);

    debug_println!("\nTest 2: sys_write (valid message)");
    let message = b"[Test] Hello from syscall test!\n";
    let result = dispatch(9, 1, message.as_ptr() as u64, message.len() as u64, 0, 0, 0);
    debug_println!("  Result: {} bytes written", result);

    debug_println!("\nTest 3: sys_write (invalid pointer)");
    let result = dispatch(9, 1, 0, 100, 0, 0, 0);
    debug_println!("  Result: {} (expected EFAULT = -14)", result);

    debug_println!("\nTest 4: sys_write (kernel address)");
    let result = dispatch(9, 1, 0xFFFF_8000_0000_0000, 100, 0, 0, 0);
    debug_println!("  Result: {} (expected EFAULT = -14)", result);

    debug_println!("\n=== Syscall Mechanism Test Complete ===\n");
}

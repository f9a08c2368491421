//! Process lifecycle management: loading, forking, and tearing down processes.

use core::sync::atomic::Ordering;

use x86_64::VirtAddr;

use crate::kernel::core::traits::{FileHandle, FileSystem, InodeId};
use crate::kernel::fs::ramfs::RAMFS;
use crate::kernel::mm::allocator::BOOT_INFO_ALLOCATOR;
use crate::kernel::mm::{PageEntry, PageSource, FRAME_TABLE, PHYS_MEM_OFFSET, USER_STACK_TOP};
use crate::kernel::process::elf::{self, ElfError, ElfHeader};
use crate::kernel::process::{Process, ProcessId, ProcessState, PROCESS_TABLE};

const PAGE_SIZE: u64 = 4096;

/// Error types for process creation
#[derive(Debug)]
pub enum CreateError {
    FrameAllocationFailed,
    PageTableCreationError(&'static str),
    FileNotFound,
    BadExecutable(ElfError),
}

impl From<ElfError> for CreateError {
    fn from(e: ElfError) -> Self {
        CreateError::BadExecutable(e)
    }
}

/// Load `name` from the root filesystem and start it as a brand new process.
///
/// The executable's `PT_LOAD` segments are registered in the supplemental page
/// table as lazy entries; nothing is actually read from disk until the first
/// page fault touches each page. The caller's command line is copied onto the
/// first stack page before the process becomes runnable.
pub fn start_process(cmdline: &str) -> Result<ProcessId, CreateError> {
    let name = cmdline.split(' ').next().unwrap_or(cmdline);
    let fs = &*RAMFS;
    let handle = fs.open(name).map_err(|_| CreateError::FileNotFound)?;
    let header = elf::read_header(fs, handle)?;
    let inode = fs.inode_of(handle);

    let phys_mem_offset = VirtAddr::new(PHYS_MEM_OFFSET.load(Ordering::Relaxed));
    let mut process = {
        let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
        let frame_allocator = allocator_lock.as_mut().ok_or(CreateError::FrameAllocationFailed)?;
        crate::kernel::process::create_process_with_context(
            VirtAddr::new(header.entry),
            frame_allocator,
            phys_mem_offset,
        )
        .map_err(CreateError::PageTableCreationError)?
    };

    for i in 0..header.phnum {
        let ph = elf::read_program_header(fs, handle, &header, i)?;
        if elf::validate_segment(&ph)? {
            install_segment(&mut process, fs, handle, inode, &ph);
        }
    }

    setup_initial_stack(&mut process, cmdline)?;
    process.registers_mut().rip = header.entry;

    fs.deny_write(handle);
    process.set_executable(handle);
    process.set_name(alloc::string::String::from(name));

    crate::kernel::process::switch::setup_process_context(&mut process);
    process.set_state(ProcessState::Ready);

    let pid = process.pid();
    PROCESS_TABLE.lock().add_process(process);

    crate::debug_println!("[Process] Loaded '{}' as PID={}", name, pid.as_u64());
    Ok(pid)
}

/// Register lazy `PageEntry`s for one `PT_LOAD` segment, page by page, using
/// the same file-byte-range splitting rule as a classic ELF loader: each page
/// gets `bytes_read` bytes copied from the file and the remainder zeroed.
fn install_segment(
    process: &mut Process,
    fs: &dyn FileSystem,
    handle: FileHandle,
    inode: InodeId,
    ph: &elf::ProgramHeader,
) {
    let page_base = ph.vaddr & !(PAGE_SIZE - 1);
    let lead_in = ph.vaddr - page_base;
    let span = lead_in + ph.memsz;
    let num_pages = span.div_ceil(PAGE_SIZE);

    let mut file_pos = ph.offset.saturating_sub(lead_in);
    let mut remaining_file = ph.filesz;

    for i in 0..num_pages {
        let page_vaddr = VirtAddr::new(page_base + i * PAGE_SIZE);
        let skip = if i == 0 { lead_in } else { 0 };
        let avail = PAGE_SIZE - skip;
        let read_here = remaining_file.min(avail);
        remaining_file -= read_here;
        let zero_here = (PAGE_SIZE - skip - read_here) as u32;

        let source = PageSource {
            file: handle,
            inode,
            offset: file_pos + skip,
            bytes_read: read_here as u32,
            zero_bytes: zero_here,
        };
        process
            .supplemental_mut()
            .insert(PageEntry::from_segment(page_vaddr, source, ph.writable()));
        let _ = fs; // source carries everything read_mmap_source/read in page_fault needs
        file_pos += PAGE_SIZE;
    }
}

/// Copies `cmdline` onto the top stack page (forced resident), tokenised on
/// whitespace, and points the process's `rsp` at the resulting `argc`/`argv`
/// frame: each token's bytes are copied onto the stack, a pointer to each
/// is pushed in reverse order so `argv[0]` ends up at the lowest address,
/// then `argv`, `argc`, and finally a faux return address of zero (so a
/// stray `ret` in user code faults instead of jumping into kernel space).
fn setup_initial_stack(process: &mut Process, cmdline: &str) -> Result<(), CreateError> {
    let stack_page = VirtAddr::new(USER_STACK_TOP - PAGE_SIZE);
    process
        .supplemental_mut()
        .allocate_stack_page(stack_page)
        .map_err(|_| CreateError::PageTableCreationError("stack page"))?;
    let handle = process
        .supplemental()
        .get(stack_page)
        .and_then(|e| e.frame)
        .expect("stack page just allocated");
    let kaddr = FRAME_TABLE.lock().kaddr(handle).expect("stack frame resident");

    let page_base_user = stack_page.as_u64();
    let write_u64 = |user_addr: u64, value: u64| unsafe {
        *((kaddr + (user_addr - page_base_user)) as *mut u64) = value;
    };

    let tokens: alloc::vec::Vec<&str> = cmdline.split_whitespace().collect();
    let argc = tokens.len().max(1) as u64;

    let mut user_sp = page_base_user + PAGE_SIZE;

    // Copy each argument string onto the stack, highest address first, and
    // record where each landed.
    let mut arg_addrs: alloc::vec::Vec<u64> = alloc::vec::Vec::with_capacity(tokens.len());
    for token in tokens.iter().rev() {
        let bytes = token.as_bytes();
        user_sp -= bytes.len() as u64 + 1;
        let koff = user_sp - page_base_user;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), (kaddr + koff) as *mut u8, bytes.len());
            *((kaddr + koff + bytes.len() as u64) as *mut u8) = 0;
        }
        arg_addrs.push(user_sp);
    }
    arg_addrs.reverse(); // arg_addrs[i] now corresponds to tokens[i]
    if tokens.is_empty() {
        // No tokens at all (empty command line): still hand the loaded
        // program a valid argv[0], matching argc's floor of 1 above.
        user_sp -= 1;
        let koff = user_sp - page_base_user;
        unsafe { *((kaddr + koff) as *mut u8) = 0 };
        arg_addrs.push(user_sp);
    }

    user_sp &= !0x7; // word-align before the pointer array

    // argv[argc] = NULL sentinel.
    user_sp -= 8;
    write_u64(user_sp, 0);

    // Pointers pushed in reverse so argv[0] ends up at the lowest address.
    for &addr in arg_addrs.iter().rev() {
        user_sp -= 8;
        write_u64(user_sp, addr);
    }
    let argv_uaddr = user_sp;

    user_sp -= 8; // argv
    write_u64(user_sp, argv_uaddr);

    user_sp -= 8; // argc
    write_u64(user_sp, argc);

    user_sp -= 8; // faux return address
    write_u64(user_sp, 0);

    process.registers_mut().rsp = user_sp;
    Ok(())
}

/// Load and start a new process on behalf of `exec`, linking it to the
/// calling process as parent. Loading happens synchronously within this call
/// (this kernel's scheduler is cooperative and never preempts mid-syscall),
/// so there is no separate load-success rendezvous to wait on: a `Result`
/// already carries exactly that information back to the caller.
pub fn spawn_process(cmdline: &str) -> Result<ProcessId, CreateError> {
    let parent_pid = PROCESS_TABLE
        .lock()
        .current_process()
        .map(Process::pid)
        .ok_or(CreateError::PageTableCreationError("no current process"))?;

    let child_pid = start_process(cmdline)?;
    if let Some(child) = PROCESS_TABLE.lock().get_process_mut(child_pid) {
        child.set_parent_pid(parent_pid);
    }
    Ok(child_pid)
}

/// Terminate a process
pub fn terminate_process(pid: ProcessId, exit_code: i32) {
    let mut table = PROCESS_TABLE.lock();

    if let Some(process) = table.get_process_mut(pid) {
        process.set_state(ProcessState::Terminated);
        process.set_exit_code(exit_code);

        let parent_pid = process.parent_pid();

        crate::console_println!("{}: exit({})", process.name(), exit_code);
        crate::debug_println!(
            "[Process] Terminated PID={} with code={}",
            pid.as_u64(),
            exit_code
        );

        // Wake up parent if it's blocked
        if let Some(ppid) = parent_pid {
            if let Some(parent) = table.get_process_mut(ppid) {
                if parent.state() == ProcessState::Blocked {
                    parent.set_state(ProcessState::Ready);
                }
            }
        }

        // Resource cleanup (page table, supplemental table, fds) is deferred
        // until the process is reaped by the parent via `wait`; the zombie
        // process remains in the table until then.
    }
}

/// Fork the current process
///
/// Creates a full copy of the current process's address space (not
/// copy-on-write: every user page is physically duplicated) with a new PID.
/// Duplicated pages are not registered in the frame table, so they are not
/// swappable; this mirrors the scope of `fork` as an extension beyond the
/// demand-paged/mmap/swap machinery the rest of this module builds on.
///
/// # Returns
/// * `Ok(pid)` - Child PID (returned to parent)
/// * `Err(e)` - Error code
pub fn fork_process() -> Result<ProcessId, CreateError> {
    let mut allocator_lock = BOOT_INFO_ALLOCATOR.lock();
    let frame_allocator = allocator_lock.as_mut().ok_or(CreateError::FrameAllocationFailed)?;

    let (current_pid, current_registers, fd_table, name) = {
        let table = PROCESS_TABLE.lock();
        let process = table
            .current_process()
            .ok_or(CreateError::PageTableCreationError("no current process"))?;
        (
            process.pid(),
            *process.registers(),
            process.clone_file_descriptors(),
            alloc::string::String::from(process.name()),
        )
    };

    // SAFETY: the currently active CR3 is this process's own page table.
    let new_page_table_frame = unsafe {
        crate::kernel::mm::user_paging::duplicate_user_page_table(frame_allocator)
            .map_err(CreateError::PageTableCreationError)?
    };
    drop(allocator_lock);

    let mut table = PROCESS_TABLE.lock();
    let pid = table.allocate_pid();

    use alloc::alloc::{alloc_zeroed, Layout};
    let kernel_stack_layout = Layout::from_size_align(16 * 1024, 16).expect("valid layout");
    let kernel_stack_ptr = unsafe { alloc_zeroed(kernel_stack_layout) };
    assert!(!kernel_stack_ptr.is_null(), "failed to allocate kernel stack");
    let kernel_stack = VirtAddr::new(kernel_stack_ptr as u64 + 16 * 1024);

    let mut child_process = Process::new(
        pid,
        new_page_table_frame,
        kernel_stack,
        VirtAddr::new(USER_STACK_TOP),
        VirtAddr::new(0),
    );

    child_process.set_parent_pid(current_pid);
    *child_process.registers_mut() = current_registers;
    child_process.set_file_descriptors(fd_table);
    child_process.set_name(name);
    child_process.registers_mut().rax = 0; // fork() returns 0 in the child

    crate::kernel::process::switch::setup_process_context(&mut child_process);
    table.add_process(child_process);

    crate::debug_println!("[Process] Forked PID={} -> PID={}", current_pid.as_u64(), pid.as_u64());
    Ok(pid)
}

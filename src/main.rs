#![no_std]
#![no_main]

use core::panic::PanicInfo;
use core::sync::atomic::Ordering;

use bootloader::{entry_point, BootInfo};

use tiny_os::arch::{self, ArchCpu, Cpu};
use tiny_os::kernel;
use tiny_os::{debug_println, hlt_loop};

entry_point!(kernel_main);

/// Statically reserved heap region backing the global allocator.
const HEAP_SIZE: usize = 2 * 1024 * 1024;

#[repr(C, align(4096))]
struct HeapRegion([u8; HEAP_SIZE]);

static mut HEAP: HeapRegion = HeapRegion([0; HEAP_SIZE]);

fn kernel_main(boot_info: &'static BootInfo) -> ! {
    arch::init_gdt();
    arch::init_idt();

    let _ = kernel::driver::init_vga();
    kernel::driver::serial::init_serial();
    kernel::driver::init_console();

    debug_println!("=== tiny_os booting ===");

    kernel::mm::PHYS_MEM_OFFSET.store(boot_info.physical_memory_offset, Ordering::SeqCst);

    // Safety: `boot_info.memory_map` lists the regions the bootloader itself
    // left unused; this is the one point in the boot sequence where that
    // holds.
    unsafe {
        let frame_allocator = kernel::mm::BootInfoFrameAllocator::init(&boot_info.memory_map);
        *kernel::mm::allocator::BOOT_INFO_ALLOCATOR.lock() = Some(frame_allocator);
    }

    // Safety: `HEAP` is a page-aligned static owned exclusively by this
    // function, used nowhere else before or after this call.
    let heap_start = unsafe { core::ptr::addr_of_mut!(HEAP) as usize };
    unsafe {
        tiny_os::init_heap(
            kernel::mm::VirtAddr::new(heap_start),
            kernel::mm::LayoutSize::new(HEAP_SIZE),
        )
        .expect("heap already initialized");
    }

    debug_println!("tiny_os: heap ready ({} KiB)", HEAP_SIZE / 1024);

    // Safety: called once, after the IDT is installed and before interrupts
    // are unmasked below.
    unsafe {
        arch::PICS.lock().initialize();
    }
    ArchCpu::enable_interrupts();

    debug_println!("tiny_os: boot complete, entering idle loop");
    hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    debug_println!("[PANIC] {}", info);
    hlt_loop();
}

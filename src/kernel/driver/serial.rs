// src/kernel/driver/serial.rs
//! COM1 シリアルポートドライバ
//!
//! `CharDevice` trait に基づいた型安全な実装。レジスタ配置・初期化シーケンスは
//! 16550 UART の標準的なもの（38400 baud, 8N1, FIFO 有効）。

use crate::kernel::core::{CharDevice, Device, DeviceError, KernelResult};
use spin::{Mutex, Once};
use x86_64::instructions::port::Port;

const SERIAL_IO_PORT: u16 = 0x3F8;

mod register_offset {
    pub const DATA: u16 = 0;
    pub const INTERRUPT_ENABLE: u16 = 1;
    pub const FIFO_CONTROL: u16 = 2;
    pub const LINE_CONTROL: u16 = 3;
    pub const MODEM_CONTROL: u16 = 4;
    pub const LINE_STATUS: u16 = 5;
    pub const SCRATCH: u16 = 7;
}

mod line_control {
    pub const DLAB_ENABLE: u8 = 0x80;
    pub const CONFIG_8N1: u8 = 0x03;
}

mod line_status {
    pub const TRANSMIT_EMPTY: u8 = 0x20;
    pub const DATA_READY: u8 = 0x01;
}

mod fifo_control {
    pub const ENABLE_AND_CLEAR: u8 = 0xC7;
}

mod modem_control {
    pub const ENABLE_IRQ_RTS_DSR: u8 = 0x0B;
}

/// 38400 baud 用の分周比 (115200 / 38400)
const BAUD_RATE_DIVISOR: u16 = 3;

const PRESENCE_TEST_BYTE: u8 = 0xAE;

/// COM1 シリアルポート
pub struct SerialPort {
    data: Port<u8>,
    interrupt_enable: Port<u8>,
    fifo_control: Port<u8>,
    line_control: Port<u8>,
    modem_control: Port<u8>,
    line_status: Port<u8>,
    scratch: Port<u8>,
    available: bool,
}

impl SerialPort {
    /// 新しい COM1 ドライバを作成（ポートはまだ初期化しない）
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: Port::new(SERIAL_IO_PORT + register_offset::DATA),
            interrupt_enable: Port::new(SERIAL_IO_PORT + register_offset::INTERRUPT_ENABLE),
            fifo_control: Port::new(SERIAL_IO_PORT + register_offset::FIFO_CONTROL),
            line_control: Port::new(SERIAL_IO_PORT + register_offset::LINE_CONTROL),
            modem_control: Port::new(SERIAL_IO_PORT + register_offset::MODEM_CONTROL),
            line_status: Port::new(SERIAL_IO_PORT + register_offset::LINE_STATUS),
            scratch: Port::new(SERIAL_IO_PORT + register_offset::SCRATCH),
            available: false,
        }
    }

    /// スクラッチレジスタへの書き込み・読み出しでハードウェアの存在を確認する
    fn probe(&mut self) -> bool {
        unsafe {
            self.scratch.write(PRESENCE_TEST_BYTE);
            for _ in 0..100 {
                core::hint::spin_loop();
            }
            self.scratch.read() == PRESENCE_TEST_BYTE
        }
    }

    fn transmit_empty(&mut self) -> bool {
        unsafe { (self.line_status.read() & line_status::TRANSMIT_EMPTY) != 0 }
    }
}

impl Default for SerialPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SerialPort {
    fn name(&self) -> &str {
        "COM1 Serial"
    }

    fn init(&mut self) -> KernelResult<()> {
        if !self.probe() {
            self.available = false;
            return Err(DeviceError::NotFound.into());
        }

        unsafe {
            self.interrupt_enable.write(0x00);

            self.line_control.write(line_control::DLAB_ENABLE);
            self.data.write((BAUD_RATE_DIVISOR & 0xFF) as u8);
            self.interrupt_enable
                .write(((BAUD_RATE_DIVISOR >> 8) & 0xFF) as u8);
            self.line_control.write(line_control::CONFIG_8N1);

            self.fifo_control.write(fifo_control::ENABLE_AND_CLEAR);
            self.modem_control.write(modem_control::ENABLE_IRQ_RTS_DSR);
        }

        self.available = true;
        Ok(())
    }

    fn reset(&mut self) -> KernelResult<()> {
        self.init()
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

impl CharDevice for SerialPort {
    fn read_byte(&self) -> KernelResult<Option<u8>> {
        if !self.available {
            return Ok(None);
        }
        // Safety: ステータス・データレジスタの読み取りは副作用を持たない。
        let ready = unsafe {
            let mut status: Port<u8> = Port::new(SERIAL_IO_PORT + register_offset::LINE_STATUS);
            (status.read() & line_status::DATA_READY) != 0
        };
        if !ready {
            return Ok(None);
        }
        let byte = unsafe {
            let mut data: Port<u8> = Port::new(SERIAL_IO_PORT + register_offset::DATA);
            data.read()
        };
        Ok(Some(byte))
    }

    fn write_byte(&mut self, byte: u8) -> KernelResult<()> {
        if !self.available {
            return Err(DeviceError::NotFound.into());
        }

        let mut spins = 0u32;
        while !self.transmit_empty() {
            spins += 1;
            if spins > 10_000_000 {
                return Err(DeviceError::Timeout.into());
            }
            core::hint::spin_loop();
        }

        unsafe {
            self.data.write(byte);
        }
        Ok(())
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte).map_err(|_| core::fmt::Error)?;
        }
        Ok(())
    }
}

/// グローバル COM1 ドライバ（遅延初期化）
pub static SERIAL1: Once<Mutex<SerialPort>> = Once::new();

/// シリアルドライバを初期化
///
/// カーネル起動時に一度だけ呼び出す必要があります。ハードウェアが存在しない
/// 場合でも `SERIAL1` 自体は初期化され、以後の書き込みは無言で無視される。
pub fn init_serial() {
    SERIAL1.call_once(|| {
        let mut port = SerialPort::new();
        let _ = port.init();
        Mutex::new(port)
    });
}

/// シリアルドライバにアクセス
///
/// # Panics
///
/// `init_serial()` が呼ばれていない場合にパニックします。
pub fn serial() -> &'static Mutex<SerialPort> {
    SERIAL1
        .get()
        .expect("Serial not initialized. Call init_serial() during kernel initialization.")
}

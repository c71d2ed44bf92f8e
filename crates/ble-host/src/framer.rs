//! Byte-by-byte H4 receive framer
//!
//! Fed one byte at a time from the UART receive interrupt. Assembles
//! complete event and ACL packets in a fixed 256-byte buffer; anything
//! else (including garbage type bytes) is discarded and the framer
//! returns to hunting for a packet boundary.

use crate::codec::PacketType;
use crate::queue::PacketQueue;

/// Size of the receive assembly buffer.
pub const RX_BUFFER_SIZE: usize = 256;

/// A complete H4 packet, copied out of the framer so it can cross the
/// ISR/foreground queue by value.
#[derive(Clone, Copy)]
pub struct RxPacket {
    len: u16,
    buf: [u8; RX_BUFFER_SIZE],
}

impl RxPacket {
    /// Copy a raw H4 packet. Panics if `bytes` exceeds the buffer; all
    /// producers are bounded by `RX_BUFFER_SIZE` already.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; RX_BUFFER_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            len: bytes.len() as u16,
            buf,
        }
    }

    /// The packet bytes, type indicator included.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }
}

/// Receive state, driven by incoming bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum FrameState {
    #[default]
    AwaitType,
    AwaitEventHeader,
    AwaitAclHeader,
    AwaitPayload,
}

/// Assembles H4 packets from a byte stream.
pub struct RxFramer {
    buf: [u8; RX_BUFFER_SIZE],
    count: usize,
    expected: usize,
    state: FrameState,
}

impl RxFramer {
    pub const fn new() -> Self {
        Self {
            buf: [0; RX_BUFFER_SIZE],
            count: 0,
            expected: 0,
            state: FrameState::AwaitType,
        }
    }

    /// Remaining buffer capacity. The ISR deasserts RTS when this hits 0.
    pub fn free_space(&self) -> usize {
        RX_BUFFER_SIZE - self.count
    }

    /// Drop any partial frame and return to hunting for a type byte.
    pub fn reset(&mut self) {
        self.count = 0;
        self.expected = 0;
        self.state = FrameState::AwaitType;
    }

    /// Feed one received byte. Returns a packet when it completes one.
    pub fn push_byte(&mut self, byte: u8) -> Option<RxPacket> {
        if self.state == FrameState::AwaitType {
            self.buf[0] = byte;
            self.count = 1;
            match PacketType::from_byte(byte) {
                Some(PacketType::Event) => {
                    self.state = FrameState::AwaitEventHeader;
                    self.expected = 3;
                }
                Some(PacketType::AclData) => {
                    self.state = FrameState::AwaitAclHeader;
                    self.expected = 5;
                }
                _ => {
                    warn!("rx framer: discarding unexpected type byte {:x}", byte);
                    self.reset();
                }
            }
            return None;
        }

        self.buf[self.count] = byte;
        self.count += 1;

        match self.state {
            FrameState::AwaitEventHeader if self.count == 3 => {
                self.expected = 3 + self.buf[2] as usize;
                self.state = FrameState::AwaitPayload;
            }
            FrameState::AwaitAclHeader if self.count == 5 => {
                let data_len = self.buf[3] as usize | (self.buf[4] as usize) << 8;
                self.expected = 5 + data_len;
                if self.expected > RX_BUFFER_SIZE {
                    warn!("rx framer: dropping oversized acl frame ({} bytes)", self.expected);
                    self.reset();
                    return None;
                }
                self.state = FrameState::AwaitPayload;
            }
            _ => {}
        }

        if self.state == FrameState::AwaitPayload && self.count == self.expected {
            let packet = RxPacket::from_slice(&self.buf[..self.count]);
            self.reset();
            return Some(packet);
        }

        None
    }
}

impl Default for RxFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// ISR half of the receive path: the framer plus the queue producer.
///
/// The platform's UART interrupt handler owns one of these, calls
/// `on_byte` for every byte drained from the hardware FIFO, and asserts
/// flow control when `free_space` reaches zero.
pub struct UartRx<'q> {
    framer: RxFramer,
    queue: &'q PacketQueue,
}

impl<'q> UartRx<'q> {
    pub const fn new(queue: &'q PacketQueue) -> Self {
        Self {
            framer: RxFramer::new(),
            queue,
        }
    }

    /// Feed one byte from the UART FIFO.
    pub fn on_byte(&mut self, byte: u8) {
        if let Some(packet) = self.framer.push_byte(byte) {
            if !self.queue.push(&packet) {
                warn!("rx queue full, dropping packet");
            }
        }
    }

    /// Remaining framer capacity, for RTS flow control.
    pub fn free_space(&self) -> usize {
        self.framer.free_space()
    }
}

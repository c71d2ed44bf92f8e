//! HCI engine: command rendezvous, controller state, vendor bring-up
//!
//! Exactly one command is in flight at any time. The submitter transmits
//! the encoded packet, raises `waiting_response`, then consumes the packet
//! queue until the matching Command Complete or Command Status arrives
//! (bounded by a deadline). Packets of any other kind observed while
//! waiting are stashed and dispatched by the next `BleHost::process` call,
//! so event ordering is preserved.

use embedded_hal::delay::DelayNs;
use embedded_io::Write;
use heapless::{Deque, Vec};
use portable_atomic::{AtomicBool, AtomicU8, Ordering};

use bcm_hcd::{HcdError, HcdImage};

use crate::codec::{self, AclData, CodecError, Command, Opcode};
use crate::framer::RxPacket;
use crate::queue::PacketQueue;
use crate::BdAddr;

/// Bounded wait for an ordinary command response, in milliseconds.
pub const COMMAND_TIMEOUT_MS: u32 = 1000;

/// Bounded wait per firmware record; the controller stalls noticeably
/// while flashing.
pub const FIRMWARE_TIMEOUT_MS: u32 = 5000;

/// Transmit scratch size: a full ATT value (512) plus ATT, L2CAP, ACL and
/// H4 headers.
pub(crate) const TX_BUFFER_SIZE: usize = 532;

/// HCI opcodes used by this stack.
pub mod opcode {
    use crate::codec::Opcode;

    pub const DISCONNECT: Opcode = Opcode::from_raw(0x0406);
    pub const READ_REMOTE_VERSION_INFORMATION: Opcode = Opcode::from_raw(0x041D);
    pub const SET_EVENT_MASK: Opcode = Opcode::from_raw(0x0C01);
    pub const RESET: Opcode = Opcode::from_raw(0x0C03);
    pub const WRITE_LOCAL_NAME: Opcode = Opcode::from_raw(0x0C13);
    pub const READ_LOCAL_VERSION_INFORMATION: Opcode = Opcode::from_raw(0x1001);
    pub const READ_BD_ADDR: Opcode = Opcode::from_raw(0x1009);

    pub const LE_SET_EVENT_MASK: Opcode = Opcode::from_raw(0x2001);
    pub const LE_READ_LOCAL_SUPPORTED_FEATURES: Opcode = Opcode::from_raw(0x2003);
    pub const LE_SET_RANDOM_ADDRESS: Opcode = Opcode::from_raw(0x2005);
    pub const LE_SET_ADVERTISING_PARAMETERS: Opcode = Opcode::from_raw(0x2006);
    pub const LE_SET_ADVERTISING_DATA: Opcode = Opcode::from_raw(0x2008);
    pub const LE_SET_SCAN_RESPONSE_DATA: Opcode = Opcode::from_raw(0x2009);
    pub const LE_SET_ADVERTISE_ENABLE: Opcode = Opcode::from_raw(0x200A);
    pub const LE_SET_SCAN_PARAMETERS: Opcode = Opcode::from_raw(0x200B);
    pub const LE_SET_SCAN_ENABLE: Opcode = Opcode::from_raw(0x200C);
    pub const LE_CREATE_CONNECTION: Opcode = Opcode::from_raw(0x200D);
    pub const LE_CONNECTION_UPDATE: Opcode = Opcode::from_raw(0x2013);

    // Broadcom vendor commands (OGF 0x3F).
    pub const BCM_WRITE_BD_ADDR: Opcode = Opcode::from_raw(0xFC01);
    pub const BCM_SET_UART_BAUD_RATE: Opcode = Opcode::from_raw(0xFC18);
    pub const BCM_DOWNLOAD_MINIDRIVER: Opcode = Opcode::from_raw(0xFC2E);
    pub const BCM_WRITE_RAM: Opcode = Opcode::from_raw(0xFC4C);
    pub const BCM_LAUNCH_RAM: Opcode = Opcode::from_raw(0xFC4E);
    pub const BCM_UPDATE_BAUDRATE: Opcode = Opcode::from_raw(0xFC77);
}

/// HCI event codes.
pub mod event {
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const ENCRYPTION_CHANGE: u8 = 0x08;
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
    pub const LE_META: u8 = 0x3E;
}

/// LE meta sub-event codes (first parameter byte of an LE meta event).
pub mod subevent {
    pub const CONNECTION_COMPLETE: u8 = 0x01;
    pub const ADVERTISING_REPORT: u8 = 0x02;
    pub const CONNECTION_UPDATE_COMPLETE: u8 = 0x03;
    pub const ENHANCED_CONNECTION_COMPLETE: u8 = 0x0A;
}

/// HCI layer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciError {
    InvalidParameters,
    BufferOverflow,
    CommandTimeout,
    UnknownPacketType,
    UnsupportedGroup,
    UnknownCommand,
    InvalidOpcode,
    InvalidEvent,
    Internal,
    Busy,
    UnsupportedVersion,
    MemoryAllocationFailed,
    /// The controller answered the command with a non-zero status code.
    CommandFailed(u8),
}

impl From<CodecError> for HciError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::BufferTooSmall | CodecError::Truncated => HciError::InvalidParameters,
            CodecError::UnknownPacketType(_) => HciError::UnknownPacketType,
        }
    }
}

/// Controller lifecycle state, driven by Command Complete / Command Status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ControllerState {
    Idle = 0,
    WaitingResponse = 1,
    Ready = 2,
    Advertising = 3,
    Scanning = 4,
    Connecting = 5,
    Connected = 6,
    Disconnected = 7,
    Sleep = 8,
    Error = 9,
}

impl ControllerState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::WaitingResponse,
            2 => Self::Ready,
            3 => Self::Advertising,
            4 => Self::Scanning,
            5 => Self::Connecting,
            6 => Self::Connected,
            7 => Self::Disconnected,
            8 => Self::Sleep,
            9 => Self::Error,
            _ => Self::Idle,
        }
    }
}

/// Controller version information, read via Read Local Version Information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VersionInfo {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

/// The HCI engine. `W` is the blocking UART transmit path, `D` the
/// millisecond delay provider.
pub struct HciEngine<'q, W, D> {
    pub(crate) tx: W,
    delay: D,
    queue: &'q PacketQueue,
    state: AtomicU8,
    waiting_response: AtomicBool,
    pending_opcode: Opcode,
    /// Return parameters (after the status byte) of the last successful
    /// Command Complete, for readback commands.
    returned: Vec<u8, 64>,
    /// Packets that arrived during a rendezvous but belong to the
    /// foreground dispatcher.
    stashed: Deque<RxPacket, 4>,
}

impl<'q, W: Write, D: DelayNs> HciEngine<'q, W, D> {
    pub fn new(tx: W, delay: D, queue: &'q PacketQueue) -> Self {
        Self {
            tx,
            delay,
            queue,
            state: AtomicU8::new(ControllerState::Idle as u8),
            waiting_response: AtomicBool::new(false),
            pending_opcode: Opcode::from_raw(0),
            returned: Vec::new(),
            stashed: Deque::new(),
        }
    }

    /// Externally visible controller state. Reads as `WaitingResponse`
    /// while a command rendezvous is in progress.
    pub fn state(&self) -> ControllerState {
        if self.waiting_response.load(Ordering::Acquire) {
            return ControllerState::WaitingResponse;
        }
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ControllerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The stable state consulted by the enable-toggle transitions.
    fn stable_state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bring the controller up: reset, then stream the vendor firmware
    /// image, then settle in `Ready`. The UART itself is initialised by
    /// the platform before this is called.
    pub fn init(&mut self, firmware: &[u8]) -> Result<(), HciError> {
        self.reset()?;
        self.load_firmware(firmware)?;
        self.set_state(ControllerState::Ready);
        Ok(())
    }

    /// Submit Reset and wait for its completion; the Command Complete
    /// handler moves the state back to `Ready`.
    pub fn reset(&mut self) -> Result<(), HciError> {
        self.submit_command(opcode::RESET, &[])
    }

    /// Serialize and transmit a command, then block until the matching
    /// Command Complete or Command Status clears the rendezvous flag.
    pub fn submit_command(&mut self, op: Opcode, params: &[u8]) -> Result<(), HciError> {
        self.submit_command_with_timeout(op, params, COMMAND_TIMEOUT_MS)
    }

    fn submit_command_with_timeout(
        &mut self,
        op: Opcode,
        params: &[u8],
        timeout_ms: u32,
    ) -> Result<(), HciError> {
        let mut buf = [0u8; TX_BUFFER_SIZE];
        let len = codec::encode_command(&Command { opcode: op, params }, &mut buf)?;
        self.transmit(&buf[..len])?;

        self.pending_opcode = op;
        self.waiting_response.store(true, Ordering::Release);

        self.await_response(timeout_ms)
    }

    /// Fire-and-forget ACL transmission; no response rendezvous.
    pub fn submit_acl(&mut self, handle: u16, data: &[u8]) -> Result<(), HciError> {
        let acl = AclData {
            handle,
            pb_flag: 0,
            bc_flag: 0,
            data,
        };
        let mut buf = [0u8; TX_BUFFER_SIZE];
        let len = codec::encode_acl(&acl, &mut buf)?;
        self.transmit(&buf[..len])
    }

    fn transmit(&mut self, bytes: &[u8]) -> Result<(), HciError> {
        self.tx.write_all(bytes).map_err(|_| {
            error!("uart transmit failed");
            HciError::Internal
        })?;
        self.tx.flush().map_err(|_| HciError::Internal)
    }

    /// Spin (1 ms steps) until the rendezvous flag clears or the deadline
    /// expires. Non-command packets seen here are kept for `process`.
    fn await_response(&mut self, timeout_ms: u32) -> Result<(), HciError> {
        let mut outcome = None;
        let mut elapsed = 0;

        loop {
            while let Some(packet) = self.queue.pop() {
                match self.consume_while_waiting(&packet) {
                    Some(result) => {
                        outcome = Some(result);
                        break;
                    }
                    None => continue,
                }
            }

            if let Some(result) = outcome {
                return result;
            }
            if !self.waiting_response.load(Ordering::Acquire) {
                return Ok(());
            }
            if elapsed >= timeout_ms {
                self.waiting_response.store(false, Ordering::Release);
                error!("command timeout, opcode {:x}", self.pending_opcode.raw());
                return Err(HciError::CommandTimeout);
            }

            self.delay.delay_ms(1);
            elapsed += 1;
        }
    }

    /// Examine one packet received during a rendezvous. Returns the
    /// command outcome if this packet ends the rendezvous.
    fn consume_while_waiting(&mut self, packet: &RxPacket) -> Option<Result<(), HciError>> {
        let bytes = packet.as_slice();
        let event = match codec::decode_event(bytes) {
            Ok(event) => event,
            Err(CodecError::UnknownPacketType(_)) => {
                // ACL data interleaves freely with the rendezvous.
                self.stash(packet);
                return None;
            }
            Err(_) => {
                self.handle_error(HciError::InvalidEvent);
                return None;
            }
        };

        match event.code {
            event::COMMAND_COMPLETE => self.on_command_complete(event.params),
            event::COMMAND_STATUS => self.on_command_status(event.params),
            _ => {
                self.stash(packet);
                None
            }
        }
    }

    fn stash(&mut self, packet: &RxPacket) {
        if self.stashed.push_back(*packet).is_err() {
            warn!("pending packet queue full, dropping");
        }
    }

    /// Next packet for foreground dispatch: stashed ones first, then the
    /// ISR queue, preserving arrival order.
    pub(crate) fn next_packet(&mut self) -> Option<RxPacket> {
        self.stashed.pop_front().or_else(|| self.queue.pop())
    }

    /// Command Complete: `[num_cmd_packets][opcode][status][return...]`.
    fn on_command_complete(&mut self, params: &[u8]) -> Option<Result<(), HciError>> {
        if params.len() < 4 {
            self.handle_error(HciError::InvalidParameters);
            return None;
        }
        let op = Opcode::from_raw(params[1] as u16 | (params[2] as u16) << 8);
        let status = params[3];

        if op != self.pending_opcode {
            warn!("command complete for unexpected opcode {:x}", op.raw());
            return None;
        }

        self.waiting_response.store(false, Ordering::Release);

        if status != 0 {
            self.handle_error(HciError::CommandFailed(status));
            return Some(Err(HciError::CommandFailed(status)));
        }

        self.returned.clear();
        let ret = &params[4..];
        // Readback scratch is bounded; longer returns are truncated.
        let keep = ret.len().min(self.returned.capacity());
        let _ = self.returned.extend_from_slice(&ret[..keep]);

        self.apply_complete_transition(op);
        Some(Ok(()))
    }

    /// Command Status: `[status][num_cmd_packets][opcode]`. The command
    /// was accepted and finishes later via another event.
    fn on_command_status(&mut self, params: &[u8]) -> Option<Result<(), HciError>> {
        if params.len() < 4 {
            self.handle_error(HciError::InvalidParameters);
            return None;
        }
        let status = params[0];
        let op = Opcode::from_raw(params[2] as u16 | (params[3] as u16) << 8);

        if op != self.pending_opcode {
            warn!("command status for unexpected opcode {:x}", op.raw());
            return None;
        }

        self.waiting_response.store(false, Ordering::Release);

        if status != 0 {
            self.handle_error(HciError::CommandFailed(status));
            return Some(Err(HciError::CommandFailed(status)));
        }

        match op {
            opcode::LE_CREATE_CONNECTION => self.set_state(ControllerState::Connecting),
            opcode::DISCONNECT => self.set_state(ControllerState::Disconnected),
            _ => {}
        }
        Some(Ok(()))
    }

    fn apply_complete_transition(&mut self, op: Opcode) {
        match op {
            opcode::RESET
            | opcode::READ_REMOTE_VERSION_INFORMATION
            | opcode::READ_LOCAL_VERSION_INFORMATION
            | opcode::READ_BD_ADDR
            | opcode::SET_EVENT_MASK
            | opcode::LE_SET_EVENT_MASK
            | opcode::LE_READ_LOCAL_SUPPORTED_FEATURES
            | opcode::LE_SET_RANDOM_ADDRESS
            | opcode::LE_SET_SCAN_PARAMETERS => self.set_state(ControllerState::Ready),
            // Enable commands toggle on the current state, not on the
            // command parameter.
            opcode::LE_SET_ADVERTISE_ENABLE => {
                if self.stable_state() == ControllerState::Advertising {
                    self.set_state(ControllerState::Ready);
                } else {
                    self.set_state(ControllerState::Advertising);
                }
            }
            opcode::LE_SET_SCAN_ENABLE => {
                if self.stable_state() == ControllerState::Scanning {
                    self.set_state(ControllerState::Ready);
                } else {
                    self.set_state(ControllerState::Scanning);
                }
            }
            _ => {}
        }
    }

    /// Event-layer error policy: log and continue, never abort the stack.
    pub(crate) fn handle_error(&self, err: HciError) {
        error!("hci error: {}", err);
    }

    /* Vendor bring-up ---------------------------------------------------- */

    /// Stream a `.hcd` firmware image to the controller, one record per
    /// command, then let it boot.
    pub fn bcm_load_firmware(&mut self, firmware: &[u8]) -> Result<(), HciError> {
        self.load_firmware(firmware)
    }

    fn load_firmware(&mut self, firmware: &[u8]) -> Result<(), HciError> {
        self.submit_command(opcode::BCM_DOWNLOAD_MINIDRIVER, &[])?;
        self.delay.delay_ms(100);

        let image = HcdImage::parse(firmware).map_err(|err| match err {
            HcdError::TruncatedRecord(_) => HciError::BufferOverflow,
            HcdError::Empty | HcdError::BadSignature(_) => HciError::Internal,
        })?;

        for record in image.records() {
            self.submit_command_with_timeout(
                Opcode::from_raw(record.opcode),
                record.params,
                FIRMWARE_TIMEOUT_MS,
            )?;
            self.delay.delay_ms(1);
        }

        // Let the controller reboot into the freshly loaded firmware.
        self.delay.delay_ms(250);
        Ok(())
    }

    /// Change the controller UART baudrate (takes effect immediately).
    pub fn bcm_set_baudrate(&mut self, baudrate: u32) -> Result<(), HciError> {
        let b = baudrate.to_le_bytes();
        let params = [b[0], b[1], b[2], b[3], 0x00, 0x00];
        self.submit_command(opcode::BCM_UPDATE_BAUDRATE, &params)
    }

    /// Program the public device address. The vendor command takes the
    /// address in reverse byte order.
    pub fn set_bt_addr(&mut self, addr: &BdAddr) -> Result<(), HciError> {
        let mut reversed = [0u8; 6];
        for (i, byte) in addr.bytes().iter().rev().enumerate() {
            reversed[i] = *byte;
        }
        self.submit_command(opcode::BCM_WRITE_BD_ADDR, &reversed)
    }

    /// Read back the device address (always exactly 6 bytes).
    pub fn get_bt_addr(&mut self) -> Result<BdAddr, HciError> {
        self.submit_command(opcode::READ_BD_ADDR, &[])?;
        if self.returned.len() < 6 {
            return Err(HciError::InvalidEvent);
        }

        // Read Bd Addr returns LSB first; undo it so that
        // `set_bt_addr(get_bt_addr()?)` round-trips.
        let mut addr = [0u8; 6];
        for i in 0..6 {
            addr[i] = self.returned[5 - i];
        }
        Ok(BdAddr::new(addr))
    }

    /// Set the user-friendly device name (padded to the 248-byte field).
    pub fn set_local_name(&mut self, name: &str) -> Result<(), HciError> {
        let mut params = [0u8; 248];
        let len = name.len().min(params.len() - 1);
        params[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.submit_command(opcode::WRITE_LOCAL_NAME, &params)
    }

    /// Program the classic event mask (8-byte little-endian bitmap).
    pub fn set_event_mask(&mut self, mask: u64) -> Result<(), HciError> {
        self.submit_command(opcode::SET_EVENT_MASK, &mask.to_le_bytes())
    }

    /// Program the LE event mask.
    pub fn le_set_event_mask(&mut self, mask: u64) -> Result<(), HciError> {
        self.submit_command(opcode::LE_SET_EVENT_MASK, &mask.to_le_bytes())
    }

    /// Query controller version information.
    pub fn get_module_status(&mut self) -> Result<VersionInfo, HciError> {
        self.submit_command(opcode::READ_LOCAL_VERSION_INFORMATION, &[])?;
        if self.returned.len() < 8 {
            return Err(HciError::InvalidEvent);
        }
        Ok(VersionInfo {
            hci_version: self.returned[0],
            hci_revision: self.returned[1] as u16 | (self.returned[2] as u16) << 8,
            lmp_version: self.returned[3],
            manufacturer: self.returned[4] as u16 | (self.returned[5] as u16) << 8,
            lmp_subversion: self.returned[6] as u16 | (self.returned[7] as u16) << 8,
        })
    }

    /// Ask the peer for its version; completes via a later event.
    pub fn read_remote_version(&mut self, handle: u16) -> Result<(), HciError> {
        self.submit_command(
            opcode::READ_REMOTE_VERSION_INFORMATION,
            &handle.to_le_bytes(),
        )
    }

    /* LE commands (intervals in milliseconds at this boundary) ----------- */

    #[allow(clippy::too_many_arguments)]
    pub fn le_set_advertising_parameters(
        &mut self,
        interval_min_ms: u16,
        interval_max_ms: u16,
        adv_type: u8,
        own_address_type: u8,
        direct_address_type: u8,
        direct_address: &BdAddr,
        channel_map: u8,
        filter_policy: u8,
    ) -> Result<(), HciError> {
        let min = ms_to_units(interval_min_ms).to_le_bytes();
        let max = ms_to_units(interval_max_ms).to_le_bytes();
        let addr = direct_address.bytes();
        let params = [
            min[0], min[1], max[0], max[1], adv_type, own_address_type, direct_address_type,
            addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], channel_map, filter_policy,
        ];
        self.submit_command(opcode::LE_SET_ADVERTISING_PARAMETERS, &params)
    }

    /// Install the advertising payload (at most 31 bytes, zero-padded in
    /// the 32-byte command block).
    pub fn le_set_advertising_data(&mut self, data: &[u8]) -> Result<(), HciError> {
        let params = padded_data_block(data)?;
        self.submit_command(opcode::LE_SET_ADVERTISING_DATA, &params)
    }

    /// Install the scan response payload.
    pub fn le_set_scan_response_data(&mut self, data: &[u8]) -> Result<(), HciError> {
        let params = padded_data_block(data)?;
        self.submit_command(opcode::LE_SET_SCAN_RESPONSE_DATA, &params)
    }

    pub fn le_set_advertise_enable(&mut self, enable: bool) -> Result<(), HciError> {
        self.submit_command(opcode::LE_SET_ADVERTISE_ENABLE, &[enable as u8])
    }

    pub fn le_set_scan_parameters(
        &mut self,
        scan_type: u8,
        interval_ms: u16,
        window_ms: u16,
        own_address_type: u8,
        filter_policy: u8,
    ) -> Result<(), HciError> {
        let interval = ms_to_units(interval_ms).to_le_bytes();
        let window = ms_to_units(window_ms).to_le_bytes();
        let params = [
            scan_type,
            interval[0],
            interval[1],
            window[0],
            window[1],
            own_address_type,
            filter_policy,
        ];
        self.submit_command(opcode::LE_SET_SCAN_PARAMETERS, &params)
    }

    pub fn le_set_scan_enable(
        &mut self,
        enable: bool,
        filter_duplicates: bool,
    ) -> Result<(), HciError> {
        self.submit_command(
            opcode::LE_SET_SCAN_ENABLE,
            &[enable as u8, filter_duplicates as u8],
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn le_create_connection(
        &mut self,
        scan_interval_ms: u16,
        scan_window_ms: u16,
        filter_policy: u8,
        peer_address_type: u8,
        peer_address: &BdAddr,
        own_address_type: u8,
        interval_min_ms: u16,
        interval_max_ms: u16,
        latency: u16,
        timeout_ms: u16,
    ) -> Result<(), HciError> {
        let mut params = [0u8; 25];
        params[0..2].copy_from_slice(&ms_to_units(scan_interval_ms).to_le_bytes());
        params[2..4].copy_from_slice(&ms_to_units(scan_window_ms).to_le_bytes());
        params[4] = filter_policy;
        params[5] = peer_address_type;
        params[6..12].copy_from_slice(peer_address.bytes());
        params[12] = own_address_type;
        params[13..15].copy_from_slice(&ms_to_units(interval_min_ms).to_le_bytes());
        params[15..17].copy_from_slice(&ms_to_units(interval_max_ms).to_le_bytes());
        params[17..19].copy_from_slice(&latency.to_le_bytes());
        params[19..21].copy_from_slice(&ms_to_units(timeout_ms).to_le_bytes());
        // Connection event length range left at the controller default.
        self.submit_command(opcode::LE_CREATE_CONNECTION, &params)
    }

    pub fn le_connection_update(
        &mut self,
        handle: u16,
        interval_min_ms: u16,
        interval_max_ms: u16,
        latency: u16,
        timeout_ms: u16,
    ) -> Result<(), HciError> {
        let mut params = [0u8; 14];
        params[0..2].copy_from_slice(&handle.to_le_bytes());
        params[2..4].copy_from_slice(&ms_to_units(interval_min_ms).to_le_bytes());
        params[4..6].copy_from_slice(&ms_to_units(interval_max_ms).to_le_bytes());
        params[6..8].copy_from_slice(&latency.to_le_bytes());
        params[8..10].copy_from_slice(&ms_to_units(timeout_ms).to_le_bytes());
        self.submit_command(opcode::LE_CONNECTION_UPDATE, &params)
    }

    /// Terminate a connection; completes via Disconnection Complete.
    pub fn disconnect(&mut self, handle: u16, reason: u8) -> Result<(), HciError> {
        let h = handle.to_le_bytes();
        self.submit_command(opcode::DISCONNECT, &[h[0], h[1], reason])
    }
}

/// Milliseconds to Bluetooth time units (0.625 ms), integer arithmetic
/// only.
pub(crate) fn ms_to_units(ms: u16) -> u16 {
    ((ms as u32) * 16 / 10) as u16
}

/// `[len][payload padded to 31]` block shared by the advertising-data and
/// scan-response-data commands.
fn padded_data_block(data: &[u8]) -> Result<[u8; 32], HciError> {
    if data.len() > 31 {
        return Err(HciError::InvalidParameters);
    }
    let mut params = [0u8; 32];
    params[0] = data.len() as u8;
    params[1..1 + data.len()].copy_from_slice(data);
    Ok(params)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn engine(queue: &PacketQueue) -> HciEngine<'_, Sink, NoDelay> {
        HciEngine::new(Sink::default(), NoDelay, queue)
    }

    #[test]
    fn test_reset_rendezvous_reaches_ready() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        queue.push(&command_complete(0x0C03, 0x00, &[]));

        hci.reset().unwrap();

        assert_eq!(hci.state(), ControllerState::Ready);
        // Reset encodes as 01 03 0C 00.
        assert_eq!(&hci.tx.bytes, &[0x01, 0x03, 0x0C, 0x00]);
    }

    #[test]
    fn test_command_timeout_clears_flag() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);

        let err = hci.reset().unwrap_err();
        assert_eq!(err, HciError::CommandTimeout);
        assert_ne!(hci.state(), ControllerState::WaitingResponse);
    }

    #[test]
    fn test_command_failure_surfaces_status() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        queue.push(&command_complete(0x0C03, 0x0C, &[]));

        let err = hci.reset().unwrap_err();
        assert_eq!(err, HciError::CommandFailed(0x0C));
        // State is never advanced on error.
        assert_eq!(hci.state(), ControllerState::Idle);
    }

    #[test]
    fn test_advertise_enable_toggles_state() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        hci.set_state(ControllerState::Ready);

        queue.push(&command_complete(0x200A, 0x00, &[]));
        hci.le_set_advertise_enable(true).unwrap();
        assert_eq!(hci.state(), ControllerState::Advertising);

        queue.push(&command_complete(0x200A, 0x00, &[]));
        hci.le_set_advertise_enable(false).unwrap();
        assert_eq!(hci.state(), ControllerState::Ready);
    }

    #[test]
    fn test_command_status_clears_rendezvous() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        hci.set_state(ControllerState::Ready);
        queue.push(&command_status(0x200D, 0x00));

        let peer = BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        hci.le_create_connection(60, 30, 0, 0, &peer, 0, 50, 100, 0, 2000)
            .unwrap();

        assert_eq!(hci.state(), ControllerState::Connecting);
    }

    #[test]
    fn test_unrelated_events_stashed_during_rendezvous() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        // A disconnection event sneaks in ahead of the completion.
        queue.push(&RxPacket::from_slice(&[
            0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13,
        ]));
        queue.push(&command_complete(0x0C03, 0x00, &[]));

        hci.reset().unwrap();

        let stashed = hci.next_packet().unwrap();
        assert_eq!(stashed.as_slice()[1], 0x05);
        assert!(hci.next_packet().is_none());
    }

    #[test]
    fn test_get_bt_addr_copies_six_bytes() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        // Controller returns the address LSB first.
        queue.push(&command_complete(
            0x1009,
            0x00,
            &[0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
        ));

        let addr = hci.get_bt_addr().unwrap();
        assert_eq!(addr.bytes(), &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn test_set_bt_addr_reverses_byte_order() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        queue.push(&command_complete(0xFC01, 0x00, &[]));

        hci.set_bt_addr(&BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]))
            .unwrap();

        // 01 | opcode FC01 | len 6 | address reversed.
        assert_eq!(
            &hci.tx.bytes,
            &[0x01, 0x01, 0xFC, 0x06, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_get_module_status_parses_version_info() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        queue.push(&command_complete(
            0x1001,
            0x00,
            &[0x0A, 0x34, 0x12, 0x0A, 0x0F, 0x00, 0x78, 0x56],
        ));

        let info = hci.get_module_status().unwrap();
        assert_eq!(info.hci_version, 0x0A);
        assert_eq!(info.hci_revision, 0x1234);
        assert_eq!(info.lmp_version, 0x0A);
        assert_eq!(info.manufacturer, 0x000F);
        assert_eq!(info.lmp_subversion, 0x5678);
    }

    #[test]
    fn test_firmware_download_streams_records() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);

        // Minidriver completion, then one per record.
        queue.push(&command_complete(0xFC2E, 0x00, &[]));
        queue.push(&command_complete(0xFC4C, 0x00, &[]));
        queue.push(&command_complete(0xFC4E, 0x00, &[]));

        let image = [
            0x4C, 0xFC, 0x02, 0xAA, 0xBB, // Write_RAM
            0x4E, 0xFC, 0x00, // Launch_RAM
        ];
        hci.bcm_load_firmware(&image).unwrap();

        // Download Minidriver, then the records replayed as commands.
        assert_eq!(
            &hci.tx.bytes,
            &[
                0x01, 0x2E, 0xFC, 0x00, // minidriver
                0x01, 0x4C, 0xFC, 0x02, 0xAA, 0xBB, // record 1
                0x01, 0x4E, 0xFC, 0x00, // record 2
            ]
        );
    }

    #[test]
    fn test_firmware_bad_signature_is_internal() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        queue.push(&command_complete(0xFC2E, 0x00, &[]));

        let err = hci.bcm_load_firmware(&[0x00, 0xFC, 0x00]).unwrap_err();
        assert_eq!(err, HciError::Internal);
    }

    #[test]
    fn test_firmware_truncated_record_is_overflow() {
        let queue = PacketQueue::new();
        let mut hci = engine(&queue);
        queue.push(&command_complete(0xFC2E, 0x00, &[]));

        let err = hci.bcm_load_firmware(&[0x4C, 0xFC, 0x09, 0x01]).unwrap_err();
        assert_eq!(err, HciError::BufferOverflow);
    }

    #[test]
    fn test_ms_to_unit_conversion() {
        assert_eq!(ms_to_units(20), 32);
        assert_eq!(ms_to_units(100), 160);
        assert_eq!(ms_to_units(1000), 1600);
        assert_eq!(ms_to_units(10240), 16384);
    }
}

//! The host stack aggregate: engine, attribute database, connection
//! record and application callbacks
//!
//! The application owns one `BleHost`, calls `init` with the controller
//! firmware image, and then drives the stack from its main loop:
//! `process` drains the packets the UART interrupt queued and dispatches
//! them: HCI events to the connection bookkeeping and the GAP callback,
//! ATT traffic to the GATT layer. Callbacks therefore always run in the
//! caller's context, never inside the interrupt.

use embedded_hal::delay::DelayNs;
use embedded_io::Write;

use crate::att;
use crate::codec::{self, CodecError, Event};
use crate::framer::RxPacket;
use crate::gap::{GapEvent, GapEventCallback};
use crate::gatt::{GattDb, GattEvent, GattEventCallback};
use crate::hci::{event, subevent, ControllerState, HciEngine, HciError};
use crate::queue::PacketQueue;

/// The single link-layer connection this design supports. Created on
/// (Enhanced) Connection Complete, destroyed on Disconnection Complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Connection {
    pub handle: u16,
    pub att_mtu: u16,
    pub connected: bool,
    pub services_discovered: bool,
}

/// The BLE host stack. `W` transmits to the controller UART, `D`
/// provides millisecond delays; received packets arrive through the
/// queue shared with the platform's `UartRx`.
pub struct BleHost<'q, W, D> {
    pub(crate) hci: HciEngine<'q, W, D>,
    pub(crate) db: GattDb,
    pub(crate) connection: Option<Connection>,
    pub(crate) gap_callback: Option<GapEventCallback>,
    pub(crate) gatt_callback: Option<GattEventCallback>,
    pub(crate) indication_pending: bool,
}

impl<'q, W: Write, D: DelayNs> BleHost<'q, W, D> {
    pub fn new(tx: W, delay: D, queue: &'q PacketQueue) -> Self {
        Self {
            hci: HciEngine::new(tx, delay, queue),
            db: GattDb::new(),
            connection: None,
            gap_callback: None,
            gatt_callback: None,
            indication_pending: false,
        }
    }

    /// Bring the controller up: reset, stream the firmware image, settle
    /// in `Ready`. Fatal errors leave the controller untouched; the
    /// caller may retry.
    pub fn init(&mut self, firmware: &[u8]) -> Result<(), HciError> {
        self.hci.init(firmware)
    }

    /// Direct access to the HCI engine for vendor operations and raw
    /// commands.
    pub fn hci(&mut self) -> &mut HciEngine<'q, W, D> {
        &mut self.hci
    }

    /// Current controller state.
    pub fn controller_state(&self) -> ControllerState {
        self.hci.state()
    }

    /// The active connection, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Dispatch everything the receive path has queued, in arrival
    /// order. Call from the application main loop.
    pub fn process(&mut self) {
        while let Some(packet) = self.hci.next_packet() {
            self.dispatch(&packet);
        }
    }

    fn dispatch(&mut self, packet: &RxPacket) {
        let bytes = packet.as_slice();
        match codec::decode_event(bytes) {
            Ok(event) => {
                self.handle_event(&event);
                return;
            }
            Err(CodecError::UnknownPacketType(_)) => {}
            Err(_) => {
                self.hci.handle_error(HciError::InvalidEvent);
                return;
            }
        }

        match codec::decode_acl(bytes) {
            Ok(acl) => {
                if let Some(att_pdu) = att::l2cap_unwrap(acl.data) {
                    self.process_att(acl.handle, att_pdu);
                }
                // Other channels are not used by this design.
            }
            Err(_) => self.hci.handle_error(HciError::UnknownPacketType),
        }
    }

    fn handle_event(&mut self, event: &Event<'_>) {
        match event.code {
            event::COMMAND_COMPLETE | event::COMMAND_STATUS => {
                // Responses are consumed inside the rendezvous; one
                // arriving here has no waiting submitter.
                warn!("unsolicited command response, code {:x}", event.code);
            }
            event::DISCONNECTION_COMPLETE => self.on_disconnection(event.params),
            event::ENCRYPTION_CHANGE => {
                if event.params.len() < 4 {
                    return;
                }
                let connection = event.params[1] as u16 | (event.params[2] as u16) << 8;
                let enabled = event.params[0] == 0 && event.params[3] != 0;
                self.emit_gatt_event(GattEvent::EncryptionChange {
                    connection,
                    enabled,
                });
            }
            event::HARDWARE_ERROR => {
                error!("controller hardware error");
            }
            event::NUMBER_OF_COMPLETED_PACKETS => {
                trace!("number of completed packets");
            }
            event::LE_META => self.handle_le_meta(event.params),
            _ => {
                trace!("unhandled event {:x}", event.code);
            }
        }
    }

    fn handle_le_meta(&mut self, params: &[u8]) {
        let Some(&sub) = params.first() else {
            return;
        };

        match sub {
            subevent::CONNECTION_COMPLETE | subevent::ENHANCED_CONNECTION_COMPLETE => {
                self.on_connection_complete(params)
            }
            subevent::ADVERTISING_REPORT => self.on_advertising_report(params),
            subevent::CONNECTION_UPDATE_COMPLETE => {
                // [sub][status][handle][interval][latency][timeout]
                if params.len() < 10 || params[1] != 0 {
                    return;
                }
                let connection = params[2] as u16 | (params[3] as u16) << 8;
                self.emit_gap(GapEvent::ConnectionUpdated {
                    connection,
                    interval: params[4] as u16 | (params[5] as u16) << 8,
                    latency: params[6] as u16 | (params[7] as u16) << 8,
                    timeout: params[8] as u16 | (params[9] as u16) << 8,
                });
            }
            _ => {
                trace!("unhandled le subevent {:x}", sub);
            }
        }
    }

    /// (Enhanced) Connection Complete: `[sub][status][handle][role]...`.
    /// The handle sits at the same offset in both layouts.
    fn on_connection_complete(&mut self, params: &[u8]) {
        if params.len() < 4 {
            return;
        }
        if params[1] != 0 {
            warn!("connection failed, status {:x}", params[1]);
            self.hci.set_state(ControllerState::Ready);
            return;
        }

        let handle = params[2] as u16 | (params[3] as u16) << 8;
        self.connection = Some(Connection {
            handle,
            att_mtu: att::ATT_DEFAULT_MTU,
            connected: true,
            services_discovered: false,
        });
        self.hci.set_state(ControllerState::Connected);
        self.emit_gap(GapEvent::Connected { connection: handle });
    }

    /// Disconnection Complete: `[status][handle][reason]`.
    fn on_disconnection(&mut self, params: &[u8]) {
        if params.len() < 4 || params[0] != 0 {
            return;
        }
        let handle = params[1] as u16 | (params[2] as u16) << 8;
        let reason = params[3];

        self.connection = None;
        self.indication_pending = false;
        self.hci.set_state(ControllerState::Disconnected);
        self.emit_gap(GapEvent::Disconnected {
            connection: handle,
            reason,
        });
    }

    /// Advertising Report: `[sub][num][event_type][addr_type][addr6]
    /// [data_len][data...][rssi]`. Only the first report is decoded.
    fn on_advertising_report(&mut self, params: &[u8]) {
        if params.len() < 11 {
            return;
        }
        let addr_type = params[3];
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&params[4..10]);

        let data_len = params[10] as usize;
        if params.len() < 11 + data_len + 1 {
            return;
        }
        let data = &params[11..11 + data_len];
        let rssi = params[11 + data_len] as i8;

        self.emit_gap(GapEvent::ScanResult {
            addr: crate::BdAddr::new(addr),
            addr_type,
            rssi,
            data,
        });
    }

    fn emit_gatt_event(&self, event: GattEvent<'_>) {
        if let Some(callback) = self.gatt_callback {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{perm, prop};
    use crate::hci::testing::{command_complete, NoDelay, Sink};
    use crate::BdAddr;
    use std::sync::Mutex;

    type TestHost<'q> = BleHost<'q, Sink, NoDelay>;

    fn host(queue: &PacketQueue) -> TestHost<'_> {
        BleHost::new(Sink::default(), NoDelay, queue)
    }

    fn feed_acl(queue: &PacketQueue, handle: u16, att_pdu: &[u8]) {
        let mut payload = [0u8; 64];
        let len = att::l2cap_wrap(att_pdu, &mut payload).unwrap();
        let mut raw = vec![
            0x02,
            (handle & 0xFF) as u8,
            (handle >> 8) as u8,
            len as u8,
            0x00,
        ];
        raw.extend_from_slice(&payload[..len]);
        queue.push(&RxPacket::from_slice(&raw));
    }

    fn feed_event(queue: &PacketQueue, code: u8, params: &[u8]) {
        let mut raw = vec![0x04, code, params.len() as u8];
        raw.extend_from_slice(params);
        queue.push(&RxPacket::from_slice(&raw));
    }

    fn connect(host: &mut TestHost<'_>, queue: &PacketQueue, handle: u16) {
        let mut params = vec![0x01, 0x00, (handle & 0xFF) as u8, (handle >> 8) as u8];
        params.extend_from_slice(&[0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        params.extend_from_slice(&[0x28, 0x00, 0x00, 0x00, 0xC8, 0x00, 0x00]);
        feed_event(queue, event::LE_META, &params);
        host.process();
    }

    fn battery_service(host: &mut TestHost<'_>) -> u16 {
        host.register_service(0x180F, true).unwrap();
        host.add_characteristic(
            0x180F,
            0x2A19,
            prop::READ | prop::NOTIFY | prop::INDICATE,
            perm::READ | perm::WRITE,
            &[0x64],
        )
        .unwrap()
    }

    #[test]
    fn test_framed_command_complete_drives_state() {
        // 04 0E 04 01 03 0C 00 framed byte-by-byte completes the Reset
        // rendezvous and lands in Ready.
        let queue = PacketQueue::new();
        let mut rx = crate::framer::UartRx::new(&queue);
        for b in [0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00] {
            rx.on_byte(b);
        }
        assert_eq!(queue.len(), 1);

        let mut host = host(&queue);
        host.hci().reset().unwrap();
        assert_eq!(host.controller_state(), ControllerState::Ready);
    }

    #[test]
    fn test_connection_record_lifecycle() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);

        connect(&mut host, &queue, 0x0040);
        let conn = host.connection().unwrap();
        assert_eq!(conn.handle, 0x0040);
        assert_eq!(conn.att_mtu, att::ATT_DEFAULT_MTU);
        assert!(conn.connected);
        assert_eq!(host.controller_state(), ControllerState::Connected);

        // [status][handle][reason]
        feed_event(&queue, event::DISCONNECTION_COMPLETE, &[0x00, 0x40, 0x00, 0x13]);
        host.process();
        assert!(host.connection().is_none());
        assert_eq!(host.controller_state(), ControllerState::Disconnected);
    }

    #[test]
    fn test_gap_events_reach_callback() {
        static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());
        fn callback(event: &GapEvent<'_>) {
            EVENTS.lock().unwrap().push(format!("{event:?}"));
        }

        let queue = PacketQueue::new();
        let mut host = host(&queue);
        host.gap_callback = Some(callback);

        connect(&mut host, &queue, 0x0040);
        feed_event(&queue, event::DISCONNECTION_COMPLETE, &[0x00, 0x40, 0x00, 0x13]);
        host.process();

        let events = EVENTS.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].contains("Connected"));
        assert!(events[1].contains("reason: 19"));
    }

    #[test]
    fn test_notification_carries_value_handle() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        let char_handle = battery_service(&mut host);
        assert_eq!(char_handle, 2);

        host.send_notification(0x0001, char_handle, &[0xAA, 0xBB])
            .unwrap();

        // H4 ACL header, L2CAP header, then 1B 03 00 AA BB.
        assert_eq!(
            &host.hci.tx.bytes,
            &[
                0x02, 0x01, 0x00, 0x09, 0x00, // ACL
                0x05, 0x00, 0x04, 0x00, // L2CAP len=5 cid=4
                0x1B, 0x03, 0x00, 0xAA, 0xBB, // ATT notification
            ]
        );
    }

    #[test]
    fn test_notification_requires_property() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        host.register_service(0x180F, true).unwrap();
        let handle = host
            .add_characteristic(0x180F, 0x2A19, prop::READ, perm::READ, &[0x64])
            .unwrap();

        assert_eq!(
            host.send_notification(0x0001, handle, &[0x00]).unwrap_err(),
            crate::gatt::GattError::RequestNotSupported
        );
        assert!(host.hci.tx.bytes.is_empty());
    }

    #[test]
    fn test_indication_confirmed_before_event() {
        static SAW_INDICATION: Mutex<Vec<(u16, Vec<u8>)>> = Mutex::new(Vec::new());
        fn callback(event: &GattEvent<'_>) {
            if let GattEvent::Indication { handle, value, .. } = event {
                SAW_INDICATION.lock().unwrap().push((*handle, value.to_vec()));
            }
        }

        let queue = PacketQueue::new();
        let mut host = host(&queue);
        battery_service(&mut host);
        host.gatt_callback = Some(callback);

        connect(&mut host, &queue, 0x0040);
        feed_acl(&queue, 0x0040, &[0x1D, 0x03, 0x00, 0xDE, 0xAD]);
        host.process();

        // Exactly one confirmation went out: L2CAP-framed ATT 0x1E.
        assert_eq!(
            &host.hci.tx.bytes,
            &[0x02, 0x40, 0x00, 0x05, 0x00, 0x01, 0x00, 0x04, 0x00, 0x1E]
        );
        let seen = SAW_INDICATION.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(3, vec![0xDE, 0xAD])]);
    }

    #[test]
    fn test_service_discovery_response_events() {
        static SERVICES: Mutex<Vec<(u16, u16, u16, bool)>> = Mutex::new(Vec::new());
        fn callback(event: &GattEvent<'_>) {
            if let GattEvent::ServiceDiscovered {
                start_handle,
                end_handle,
                uuid,
                is_primary,
                ..
            } = event
            {
                SERVICES
                    .lock()
                    .unwrap()
                    .push((*start_handle, *end_handle, *uuid, *is_primary));
            }
        }

        let queue = PacketQueue::new();
        let mut host = host(&queue);
        host.gatt_callback = Some(callback);

        connect(&mut host, &queue, 0x0040);
        feed_acl(
            &queue,
            0x0040,
            &[
                0x11, 0x06, 0x01, 0x00, 0x05, 0x00, 0x0F, 0x18, 0x06, 0x00, 0x0B, 0x00, 0x0A,
                0x18,
            ],
        );
        host.process();

        let services = SERVICES.lock().unwrap();
        assert_eq!(
            services.as_slice(),
            &[(1, 5, 0x180F, true), (6, 11, 0x180A, true)]
        );
    }

    #[test]
    fn test_server_answers_read_request() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        battery_service(&mut host);

        connect(&mut host, &queue, 0x0040);
        // Read the battery level value (handle 3).
        feed_acl(&queue, 0x0040, &[0x0A, 0x03, 0x00]);
        host.process();

        assert_eq!(
            &host.hci.tx.bytes,
            &[0x02, 0x40, 0x00, 0x06, 0x00, 0x02, 0x00, 0x04, 0x00, 0x0B, 0x64]
        );
    }

    #[test]
    fn test_server_rejects_unknown_read_handle() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        battery_service(&mut host);

        connect(&mut host, &queue, 0x0040);
        feed_acl(&queue, 0x0040, &[0x0A, 0x30, 0x00]);
        host.process();

        // Error Response: request 0x0A, handle 0x0030, Invalid Handle.
        assert_eq!(
            &host.hci.tx.bytes,
            &[0x02, 0x40, 0x00, 0x09, 0x00, 0x05, 0x00, 0x04, 0x00, 0x01, 0x0A, 0x30, 0x00, 0x01]
        );
    }

    #[test]
    fn test_server_write_updates_value() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        battery_service(&mut host);

        connect(&mut host, &queue, 0x0040);
        feed_acl(&queue, 0x0040, &[0x12, 0x03, 0x00, 0x2A]);
        host.process();

        assert_eq!(
            host.read_characteristic_value(0x180F, 0x2A19).unwrap(),
            &[0x2A]
        );
        // Write Response went out.
        assert_eq!(
            &host.hci.tx.bytes,
            &[0x02, 0x40, 0x00, 0x05, 0x00, 0x01, 0x00, 0x04, 0x00, 0x13]
        );
    }

    #[test]
    fn test_server_service_discovery() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        battery_service(&mut host);

        connect(&mut host, &queue, 0x0040);
        feed_acl(
            &queue,
            0x0040,
            &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28],
        );
        host.process();

        // One entry: start 1, end 3, uuid 0x180F.
        assert_eq!(
            &host.hci.tx.bytes,
            &[
                0x02, 0x40, 0x00, 0x0C, 0x00, 0x08, 0x00, 0x04, 0x00, 0x11, 0x06, 0x01, 0x00,
                0x03, 0x00, 0x0F, 0x18
            ]
        );
    }

    #[test]
    fn test_mtu_exchange_negotiates_minimum() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);

        connect(&mut host, &queue, 0x0040);
        // Client offers 160; we answer with our 247 and settle on 160.
        feed_acl(&queue, 0x0040, &[0x02, 0xA0, 0x00]);
        host.process();

        assert_eq!(host.connection().unwrap().att_mtu, 160);
        assert_eq!(
            &host.hci.tx.bytes,
            &[0x02, 0x40, 0x00, 0x07, 0x00, 0x03, 0x00, 0x04, 0x00, 0x03, 0xF7, 0x00]
        );
    }

    #[test]
    fn test_foreign_l2cap_channel_ignored() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        connect(&mut host, &queue, 0x0040);

        // Signaling-channel frame: CID 0x0005.
        let raw = [0x02, 0x40, 0x00, 0x05, 0x00, 0x01, 0x00, 0x05, 0x00, 0x0A];
        queue.push(&RxPacket::from_slice(&raw));
        host.process();

        assert!(host.hci.tx.bytes.is_empty());
    }

    #[test]
    fn test_subscribe_writes_cccd() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        let char_handle = battery_service(&mut host);

        host.subscribe_characteristic(0x0040, char_handle, crate::gatt::Subscription::Notification)
            .unwrap();

        // Write Request to handle+2 with 0x0001.
        assert_eq!(
            &host.hci.tx.bytes,
            &[
                0x02, 0x40, 0x00, 0x09, 0x00, 0x05, 0x00, 0x04, 0x00, 0x12, 0x04, 0x00, 0x01,
                0x00
            ]
        );
    }

    #[test]
    fn test_indication_busy_until_confirmed() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        let char_handle = battery_service(&mut host);
        connect(&mut host, &queue, 0x0040);

        host.send_indication(0x0040, char_handle, &[0x01]).unwrap();
        assert_eq!(
            host.send_indication(0x0040, char_handle, &[0x02]).unwrap_err(),
            crate::gatt::GattError::Busy
        );

        // Peer confirms; the next indication may go out.
        feed_acl(&queue, 0x0040, &[0x1E]);
        host.process();
        host.send_indication(0x0040, char_handle, &[0x02]).unwrap();
    }

    #[test]
    fn test_scan_result_event() {
        static RESULTS: Mutex<Vec<(BdAddr, i8, Vec<u8>)>> = Mutex::new(Vec::new());
        fn callback(event: &GapEvent<'_>) {
            if let GapEvent::ScanResult { addr, rssi, data, .. } = event {
                RESULTS.lock().unwrap().push((*addr, *rssi, data.to_vec()));
            }
        }

        let queue = PacketQueue::new();
        let mut host = host(&queue);
        host.gap_callback = Some(callback);

        // One report: addr 11:22:33:44:55:66, 3 data bytes, rssi -60.
        let mut params = vec![0x02, 0x01, 0x00, 0x00];
        params.extend_from_slice(&[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        params.extend_from_slice(&[0x03, 0x02, 0x01, 0x06]);
        params.push((-60i8) as u8);
        feed_event(&queue, event::LE_META, &params);
        host.process();

        let results = RESULTS.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, -60);
        assert_eq!(results[0].2, vec![0x02, 0x01, 0x06]);
    }

    #[test]
    fn test_gap_disconnect_requires_matching_connection() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);

        assert_eq!(
            host.disconnect(0x0040).unwrap_err(),
            crate::gap::GapError::InvalidParameters
        );

        connect(&mut host, &queue, 0x0040);
        queue.push(&crate::hci::testing::command_status(0x0406, 0x00));
        host.disconnect(0x0040).unwrap();
        assert_eq!(host.controller_state(), ControllerState::Disconnected);
    }

    #[test]
    fn test_gap_validation_ranges() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);

        // Scan window must not exceed the interval.
        assert!(host.start_scanning(50, 60).is_err());
        // Interval below the integer lower bound.
        assert!(host.start_scanning(2, 1).is_err());
        // Supervision timeout out of range.
        assert!(host
            .update_connection_parameters(0x0040, 50, 100, 0, 50)
            .is_err());
        // Latency too large.
        assert!(host
            .update_connection_parameters(0x0040, 50, 100, 501, 2000)
            .is_err());
        // Empty channel map.
        assert!(host
            .set_advertising_parameters(
                crate::gap::AdvertisingType::ConnectableUndirected,
                100,
                100,
                0x00,
                0x00
            )
            .is_err());
        assert!(host.hci.tx.bytes.is_empty());
    }

    #[test]
    fn test_set_device_name_builds_adv_payload() {
        let queue = PacketQueue::new();
        let mut host = host(&queue);
        queue.push(&command_complete(0x0C13, 0x00, &[]));
        queue.push(&command_complete(0x2008, 0x00, &[]));

        host.set_device_name("pi").unwrap();

        let tx = &host.hci.tx.bytes;
        // First command: Write Local Name, 248-byte padded field.
        assert_eq!(&tx[..4], &[0x01, 0x13, 0x0C, 248]);
        assert_eq!(&tx[4..6], b"pi");

        // Second command: LE Set Advertising Data with flags + name ADs.
        let adv = &tx[4 + 248..];
        assert_eq!(&adv[..4], &[0x01, 0x08, 0x20, 32]);
        assert_eq!(adv[4], 7); // significant payload length
        assert_eq!(&adv[5..13], &[0x02, 0x01, 0x06, 0x03, 0x09, b'p', b'i', 0x00]);
    }
}

//! GAP: policy facade over the HCI engine
//!
//! Validates parameter ranges, converts the application's view
//! (milliseconds, device names, peer addresses) into HCI commands, and
//! reports link-level happenings through a single callback.

use embedded_hal::delay::DelayNs;
use embedded_io::Write;

use crate::hci::HciError;
use crate::host::BleHost;
use crate::BdAddr;

/// Advertising interval bounds in milliseconds.
pub const ADV_INTERVAL_MIN_MS: u16 = 20;
pub const ADV_INTERVAL_MAX_MS: u16 = 10240;

/// Scan interval bounds in milliseconds (lower bound rounded up from the
/// 2.5 ms the radio supports; this boundary is integer-only).
pub const SCAN_INTERVAL_MIN_MS: u16 = 3;
pub const SCAN_INTERVAL_MAX_MS: u16 = 10240;

/// Supervision timeout bounds in milliseconds.
pub const CONN_TIMEOUT_MIN_MS: u16 = 100;
pub const CONN_TIMEOUT_MAX_MS: u16 = 32000;

/// Largest acceptable peripheral latency, in connection events.
pub const CONN_LATENCY_MAX: u16 = 500;

/// Disconnect reason sent on a host-initiated teardown.
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

/// Advertising PDU types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AdvertisingType {
    /// Connectable undirected advertising.
    ConnectableUndirected = 0x00,
    /// Connectable directed advertising.
    ConnectableDirected = 0x01,
    /// Scannable undirected advertising.
    ScannableUndirected = 0x02,
    /// Non-connectable undirected advertising.
    NonConnectableUndirected = 0x03,
}

/// Advertising channel bits.
pub mod adv_channel {
    pub const CH_37: u8 = 0x01;
    pub const CH_38: u8 = 0x02;
    pub const CH_39: u8 = 0x04;
    pub const ALL: u8 = 0x07;
}

/// GAP layer errors; HCI failures are carried through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GapError {
    InvalidParameters,
    Hci(HciError),
}

impl From<HciError> for GapError {
    fn from(err: HciError) -> Self {
        GapError::Hci(err)
    }
}

/// Events delivered to the application's GAP callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapEvent<'a> {
    /// A link-layer connection was established.
    Connected { connection: u16 },
    /// A connection ended; `reason` is the controller's error code.
    Disconnected { connection: u16, reason: u8 },
    /// Connection parameters changed. Interval and timeout are in
    /// controller time units as reported by the event.
    ConnectionUpdated {
        connection: u16,
        interval: u16,
        latency: u16,
        timeout: u16,
    },
    /// One advertising report from an active scan.
    ScanResult {
        addr: BdAddr,
        addr_type: u8,
        rssi: i8,
        data: &'a [u8],
    },
}

/// Callback invoked for every GAP event.
pub type GapEventCallback = fn(&GapEvent<'_>);

impl<'q, W: Write, D: DelayNs> BleHost<'q, W, D> {
    /// Store the GAP callback and program the controller address.
    pub fn gap_init(
        &mut self,
        callback: GapEventCallback,
        addr: &BdAddr,
    ) -> Result<(), GapError> {
        if addr.bytes() == &[0u8; 6] {
            return Err(GapError::InvalidParameters);
        }
        self.gap_callback = Some(callback);
        self.hci.set_bt_addr(addr)?;
        Ok(())
    }

    /// Register the GATT event callback.
    pub fn register_gatt_callback(&mut self, callback: crate::gatt::GattEventCallback) {
        self.gatt_callback = Some(callback);
    }

    /// Set the controller's local name and advertise it: a Flags AD
    /// (general discoverable, BR/EDR unsupported) followed by as much of
    /// the name as fits the 31-byte advertising payload.
    pub fn set_device_name(&mut self, name: &str) -> Result<(), GapError> {
        self.hci.set_local_name(name)?;

        let mut adv = [0u8; 31];
        adv[0] = 0x02; // Flags AD: length
        adv[1] = 0x01; // Flags AD type
        adv[2] = 0x06; // LE General Discoverable | BR/EDR Not Supported

        let name_len = name.len().min(adv.len() - 5);
        adv[3] = (name_len + 1) as u8;
        adv[4] = 0x09; // Complete Local Name AD type
        adv[5..5 + name_len].copy_from_slice(&name.as_bytes()[..name_len]);

        self.hci.le_set_advertising_data(&adv[..5 + name_len])?;
        Ok(())
    }

    /// Start advertising with a fixed policy: the given interval for both
    /// bounds, public own address, all three channels, no filtering.
    pub fn start_advertising(
        &mut self,
        interval_ms: u16,
        connectable: bool,
    ) -> Result<(), GapError> {
        let adv_type = if connectable {
            AdvertisingType::ConnectableUndirected
        } else {
            AdvertisingType::NonConnectableUndirected
        };

        self.hci.le_set_advertising_parameters(
            interval_ms,
            interval_ms,
            adv_type as u8,
            0x00, // own address: public
            0x00, // direct address type: public
            &BdAddr::new([0; 6]),
            adv_channel::ALL,
            0x00, // filter: allow all
        )?;
        self.hci.le_set_advertise_enable(true)?;
        Ok(())
    }

    /// Stop advertising.
    pub fn stop_advertising(&mut self) -> Result<(), GapError> {
        self.hci.le_set_advertise_enable(false)?;
        Ok(())
    }

    /// Advertise with explicit parameters. Intervals are validated
    /// against the controller's supported range, and at least one of the
    /// three advertising channels must be enabled.
    pub fn set_advertising_parameters(
        &mut self,
        adv_type: AdvertisingType,
        interval_min_ms: u16,
        interval_max_ms: u16,
        channel_map: u8,
        filter_policy: u8,
    ) -> Result<(), GapError> {
        if interval_min_ms < ADV_INTERVAL_MIN_MS
            || interval_min_ms > interval_max_ms
            || interval_max_ms > ADV_INTERVAL_MAX_MS
        {
            return Err(GapError::InvalidParameters);
        }
        if channel_map & adv_channel::ALL == 0 {
            return Err(GapError::InvalidParameters);
        }

        self.hci.le_set_advertising_parameters(
            interval_min_ms,
            interval_max_ms,
            adv_type as u8,
            0x00,
            0x00,
            &BdAddr::new([0; 6]),
            channel_map,
            filter_policy,
        )?;
        Ok(())
    }

    /// Start an active scan with duplicate filtering.
    pub fn start_scanning(&mut self, interval_ms: u16, window_ms: u16) -> Result<(), GapError> {
        if window_ms > interval_ms
            || interval_ms < SCAN_INTERVAL_MIN_MS
            || interval_ms > SCAN_INTERVAL_MAX_MS
        {
            return Err(GapError::InvalidParameters);
        }

        self.hci.le_set_scan_parameters(
            0x01, // active scanning
            interval_ms,
            window_ms,
            0x00, // own address: public
            0x00, // accept all advertisers
        )?;
        self.hci.le_set_scan_enable(true, true)?;
        Ok(())
    }

    /// Stop scanning.
    pub fn stop_scanning(&mut self) -> Result<(), GapError> {
        self.hci.le_set_scan_enable(false, false)?;
        Ok(())
    }

    /// Initiate a connection to a peer. Connection parameters are fixed
    /// defaults: 50-100 ms interval, no latency, 2 s supervision timeout.
    pub fn connect(
        &mut self,
        peer_addr: &BdAddr,
        scan_interval_ms: u16,
        scan_window_ms: u16,
    ) -> Result<(), GapError> {
        self.hci.le_create_connection(
            scan_interval_ms,
            scan_window_ms,
            0x00, // filter list not used
            0x00, // peer address: public
            peer_addr,
            0x00, // own address: public
            50,
            100,
            0,
            2000,
        )?;
        Ok(())
    }

    /// Tear down the active connection.
    pub fn disconnect(&mut self, connection: u16) -> Result<(), GapError> {
        let valid = self
            .connection
            .as_ref()
            .is_some_and(|c| c.connected && c.handle == connection);
        if !valid {
            return Err(GapError::InvalidParameters);
        }

        self.hci
            .disconnect(connection, REASON_REMOTE_USER_TERMINATED)?;
        Ok(())
    }

    /// Renegotiate connection parameters.
    pub fn update_connection_parameters(
        &mut self,
        connection: u16,
        interval_min_ms: u16,
        interval_max_ms: u16,
        latency: u16,
        timeout_ms: u16,
    ) -> Result<(), GapError> {
        if interval_min_ms > interval_max_ms
            || timeout_ms < CONN_TIMEOUT_MIN_MS
            || timeout_ms > CONN_TIMEOUT_MAX_MS
            || latency > CONN_LATENCY_MAX
        {
            return Err(GapError::InvalidParameters);
        }

        self.hci.le_connection_update(
            connection,
            interval_min_ms,
            interval_max_ms,
            latency,
            timeout_ms,
        )?;
        Ok(())
    }

    pub(crate) fn emit_gap(&self, event: GapEvent<'_>) {
        if let Some(callback) = self.gap_callback {
            callback(&event);
        }
    }
}

//! GATT: local attribute database, server and client procedures
//!
//! The database is a fixed-capacity table of services and characteristics
//! with monotonically allocated 16-bit handles. The server side answers
//! peer ATT requests from the table; the client side issues discovery,
//! read/write and subscription requests and turns the responses into
//! application events.

use embedded_hal::delay::DelayNs;
use embedded_io::Write;
use heapless::Vec;

use crate::att::{self, pdu, ATT_DEFAULT_MTU, ATT_MAX_MTU, ATT_SERVER_MTU};
use crate::hci::TX_BUFFER_SIZE;
use crate::host::BleHost;

/// Maximum number of registered services.
pub const MAX_SERVICES: usize = 10;

/// Maximum characteristics per service.
pub const MAX_CHARACTERISTICS: usize = 10;

/// Maximum characteristic value size in bytes.
pub const MAX_VALUE_LENGTH: usize = 512;

/// Characteristic property bits.
pub mod prop {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_NO_RESP: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
    pub const AUTH_SIGNED_WRITE: u8 = 0x40;
    pub const EXTENDED_PROPS: u8 = 0x80;
}

/// Attribute permission bits.
pub mod perm {
    pub const NONE: u8 = 0x00;
    pub const READ: u8 = 0x01;
    pub const WRITE: u8 = 0x02;
    pub const READ_ENC: u8 = 0x04;
    pub const WRITE_ENC: u8 = 0x08;
    pub const READ_AUTHEN: u8 = 0x10;
    pub const WRITE_AUTHEN: u8 = 0x20;
    pub const READ_AUTHOR: u8 = 0x40;
    pub const WRITE_AUTHOR: u8 = 0x80;
}

/// GATT errors. Values below 0x80 are ATT protocol error codes and go out
/// on the wire in Error Responses; the rest are local-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum GattError {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    AttributeNotFound = 0x0A,
    InvalidValueLength = 0x0D,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
    InvalidParameter = 0x81,
    Busy = 0x84,
}

impl GattError {
    /// The ATT error code carried in an Error Response.
    pub const fn att_code(self) -> u8 {
        self as u8
    }
}

/// Subscription kind written to a CCCD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum Subscription {
    Notification = 0x0001,
    Indication = 0x0002,
}

/// Events delivered to the application's GATT callback. Payload slices
/// borrow from the packet being dispatched and are only valid for the
/// duration of the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattEvent<'a> {
    /// A peer read a local characteristic value.
    ReadRequest { connection: u16, handle: u16 },
    /// A peer wrote a local characteristic value.
    WriteRequest {
        connection: u16,
        handle: u16,
        value: &'a [u8],
    },
    /// The ATT MTU for the connection was (re)negotiated.
    MtuExchanged { connection: u16, mtu: u16 },
    /// One service found during primary service discovery.
    ServiceDiscovered {
        connection: u16,
        start_handle: u16,
        end_handle: u16,
        uuid: u16,
        is_primary: bool,
    },
    /// One characteristic found during characteristic discovery.
    CharacteristicDiscovered {
        connection: u16,
        handle: u16,
        value_handle: u16,
        uuid: u16,
        properties: u8,
    },
    /// Response to an outbound Read Request.
    ReadResponse { connection: u16, value: &'a [u8] },
    /// Response to an outbound Write Request.
    WriteResponse { connection: u16 },
    /// Raw Read By Type response payload.
    ReadByTypeResponse { connection: u16, data: &'a [u8] },
    /// Raw Find Information response payload.
    FindInformationResponse { connection: u16, data: &'a [u8] },
    /// Raw Find By Type Value response payload.
    FindByTypeValueResponse { connection: u16, data: &'a [u8] },
    /// A peer notified a characteristic value.
    Notification {
        connection: u16,
        handle: u16,
        value: &'a [u8],
    },
    /// A peer indicated a characteristic value (already confirmed).
    Indication {
        connection: u16,
        handle: u16,
        value: &'a [u8],
    },
    /// The peer confirmed our indication.
    IndicationConfirmed { connection: u16 },
    /// The peer rejected a request.
    ErrorResponse {
        connection: u16,
        request_opcode: u8,
        handle: u16,
        error_code: u8,
    },
    /// Link encryption was enabled or disabled.
    EncryptionChange { connection: u16, enabled: bool },
    /// Unhandled ATT opcode.
    Unknown {
        connection: u16,
        opcode: u8,
        payload: &'a [u8],
    },
}

/// Callback invoked for every GATT event.
pub type GattEventCallback = fn(&GattEvent<'_>);

/// A characteristic: declaration, value storage and access control.
#[derive(Debug, Clone)]
pub struct Characteristic {
    pub handle: u16,
    pub uuid: u16,
    pub properties: u8,
    pub permissions: u8,
    pub value_handle: u16,
    value: Vec<u8, MAX_VALUE_LENGTH>,
}

impl Characteristic {
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// A service and its characteristics.
#[derive(Debug, Clone)]
pub struct Service {
    pub handle: u16,
    pub uuid: u16,
    pub is_primary: bool,
    pub end_handle: u16,
    characteristics: Vec<Characteristic, MAX_CHARACTERISTICS>,
}

impl Service {
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }
}

/// The local attribute table. Handles start at 1 and are allocated
/// monotonically: one per service declaration, one per characteristic
/// declaration, one per characteristic value. Handles are never reused,
/// so removal keeps the remaining services' handles stable.
pub struct GattDb {
    services: Vec<Service, MAX_SERVICES>,
    next_handle: u16,
}

impl GattDb {
    pub const fn new() -> Self {
        Self {
            services: Vec::new(),
            next_handle: 1,
        }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Append a service and allocate its declaration handle.
    pub fn register_service(&mut self, uuid: u16, is_primary: bool) -> Result<u16, GattError> {
        if self.services.is_full() {
            return Err(GattError::InsufficientResources);
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        let service = Service {
            handle,
            uuid,
            is_primary,
            end_handle: handle,
            characteristics: Vec::new(),
        };
        // Capacity checked above.
        let _ = self.services.push(service);
        Ok(handle)
    }

    /// Remove a service; later services shift left but keep their handles.
    pub fn remove_service(&mut self, uuid: u16) -> Result<(), GattError> {
        let index = self
            .services
            .iter()
            .position(|s| s.uuid == uuid)
            .ok_or(GattError::InvalidHandle)?;
        self.services.remove(index);
        Ok(())
    }

    /// Append a characteristic to a service, allocating its declaration
    /// and value handles.
    pub fn add_characteristic(
        &mut self,
        service_uuid: u16,
        char_uuid: u16,
        properties: u8,
        permissions: u8,
        initial_value: &[u8],
    ) -> Result<u16, GattError> {
        let next_handle = &mut self.next_handle;
        let service = self
            .services
            .iter_mut()
            .find(|s| s.uuid == service_uuid)
            .ok_or(GattError::InvalidHandle)?;
        if service.characteristics.is_full() {
            return Err(GattError::InsufficientResources);
        }
        if initial_value.len() > MAX_VALUE_LENGTH {
            return Err(GattError::InvalidValueLength);
        }

        let handle = *next_handle;
        let value_handle = handle + 1;
        *next_handle += 2;

        let mut value = Vec::new();
        // Length checked against capacity above.
        let _ = value.extend_from_slice(initial_value);

        let _ = service.characteristics.push(Characteristic {
            handle,
            uuid: char_uuid,
            properties,
            permissions,
            value_handle,
            value,
        });
        service.end_handle = value_handle;
        Ok(handle)
    }

    /// Update a value addressed by service and characteristic UUID.
    pub fn update_value(
        &mut self,
        service_uuid: u16,
        char_uuid: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        if value.len() > MAX_VALUE_LENGTH {
            return Err(GattError::InvalidValueLength);
        }
        let characteristic = self
            .characteristic_by_uuid_mut(service_uuid, char_uuid)
            .ok_or(GattError::InvalidHandle)?;

        characteristic.value.clear();
        let _ = characteristic.value.extend_from_slice(value);
        Ok(())
    }

    /// Read a value addressed by service and characteristic UUID.
    pub fn read_value(&self, service_uuid: u16, char_uuid: u16) -> Result<&[u8], GattError> {
        let service = self
            .services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or(GattError::InvalidHandle)?;
        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.uuid == char_uuid)
            .ok_or(GattError::InvalidHandle)?;
        Ok(&characteristic.value)
    }

    fn characteristic_by_uuid_mut(
        &mut self,
        service_uuid: u16,
        char_uuid: u16,
    ) -> Option<&mut Characteristic> {
        self.services
            .iter_mut()
            .find(|s| s.uuid == service_uuid)?
            .characteristics
            .iter_mut()
            .find(|c| c.uuid == char_uuid)
    }

    /// Look up a characteristic by declaration or value handle.
    pub fn characteristic_by_handle(&self, handle: u16) -> Option<&Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.handle == handle || c.value_handle == handle)
    }

    fn characteristic_by_handle_mut(&mut self, handle: u16) -> Option<&mut Characteristic> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.handle == handle || c.value_handle == handle)
    }
}

impl Default for GattDb {
    fn default() -> Self {
        Self::new()
    }
}

/* Client and server procedures ------------------------------------------ */

impl<'q, W: Write, D: DelayNs> BleHost<'q, W, D> {
    /// Register a service in the local database.
    pub fn register_service(&mut self, uuid: u16, is_primary: bool) -> Result<u16, GattError> {
        self.db.register_service(uuid, is_primary)
    }

    /// Remove a service from the local database.
    pub fn remove_service(&mut self, uuid: u16) -> Result<(), GattError> {
        self.db.remove_service(uuid)
    }

    /// Add a characteristic to a registered service.
    pub fn add_characteristic(
        &mut self,
        service_uuid: u16,
        char_uuid: u16,
        properties: u8,
        permissions: u8,
        initial_value: &[u8],
    ) -> Result<u16, GattError> {
        self.db
            .add_characteristic(service_uuid, char_uuid, properties, permissions, initial_value)
    }

    /// Update a local characteristic value (no notification is sent).
    pub fn update_characteristic_value(
        &mut self,
        service_uuid: u16,
        char_uuid: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        self.db.update_value(service_uuid, char_uuid, value)
    }

    /// Read a local characteristic value.
    pub fn read_characteristic_value(
        &self,
        service_uuid: u16,
        char_uuid: u16,
    ) -> Result<&[u8], GattError> {
        self.db.read_value(service_uuid, char_uuid)
    }

    /// Notify a subscribed peer of a characteristic value. The
    /// characteristic must carry the Notify property; the PDU always
    /// carries the value handle.
    pub fn send_notification(
        &mut self,
        connection: u16,
        char_handle: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        let (value_handle, properties) = {
            let c = self
                .db
                .characteristic_by_handle(char_handle)
                .ok_or(GattError::InvalidHandle)?;
            (c.value_handle, c.properties)
        };
        if properties & prop::NOTIFY == 0 {
            return Err(GattError::RequestNotSupported);
        }

        self.send_handle_value(connection, pdu::HANDLE_VALUE_NOTIFICATION, value_handle, value)
    }

    /// Indicate a characteristic value; the peer must confirm before the
    /// next indication can be sent.
    pub fn send_indication(
        &mut self,
        connection: u16,
        char_handle: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        if self.indication_pending {
            return Err(GattError::Busy);
        }
        let (value_handle, properties) = {
            let c = self
                .db
                .characteristic_by_handle(char_handle)
                .ok_or(GattError::InvalidHandle)?;
            (c.value_handle, c.properties)
        };
        if properties & prop::INDICATE == 0 {
            return Err(GattError::RequestNotSupported);
        }

        self.send_handle_value(connection, pdu::HANDLE_VALUE_INDICATION, value_handle, value)?;
        self.indication_pending = true;
        Ok(())
    }

    fn send_handle_value(
        &mut self,
        connection: u16,
        opcode: u8,
        value_handle: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        if value.len() > MAX_VALUE_LENGTH {
            return Err(GattError::InvalidValueLength);
        }

        let mut att: Vec<u8, { 3 + MAX_VALUE_LENGTH }> = Vec::new();
        let _ = att.push(opcode);
        let _ = att.extend_from_slice(&value_handle.to_le_bytes());
        let _ = att.extend_from_slice(value);
        self.send_att(connection, &att)
    }

    /// Ask the peer to raise the ATT MTU.
    pub fn exchange_mtu(&mut self, connection: u16, mtu: u16) -> Result<(), GattError> {
        if mtu < ATT_DEFAULT_MTU || mtu > ATT_MAX_MTU {
            return Err(GattError::InvalidParameter);
        }
        let m = mtu.to_le_bytes();
        self.send_att(connection, &[pdu::EXCHANGE_MTU_REQUEST, m[0], m[1]])
    }

    /// Discover all primary services (Read By Group Type, UUID 0x2800,
    /// full handle range).
    pub fn discover_services(&mut self, connection: u16) -> Result<(), GattError> {
        self.send_att(
            connection,
            &[
                pdu::READ_BY_GROUP_TYPE_REQUEST,
                0x00,
                0x01,
                0xFF,
                0xFF,
                0x00,
                0x28,
            ],
        )
    }

    /// Discover characteristics in a handle range (Read By Type, UUID
    /// 0x2803).
    pub fn discover_characteristics(
        &mut self,
        connection: u16,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<(), GattError> {
        let s = start_handle.to_le_bytes();
        let e = end_handle.to_le_bytes();
        self.send_att(
            connection,
            &[pdu::READ_BY_TYPE_REQUEST, s[0], s[1], e[0], e[1], 0x03, 0x28],
        )
    }

    /// Read a remote characteristic value.
    pub fn read_characteristic(&mut self, connection: u16, handle: u16) -> Result<(), GattError> {
        let h = handle.to_le_bytes();
        self.send_att(connection, &[pdu::READ_REQUEST, h[0], h[1]])
    }

    /// Write a remote characteristic value (with response).
    pub fn write_characteristic(
        &mut self,
        connection: u16,
        handle: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        if value.len() > MAX_VALUE_LENGTH {
            return Err(GattError::InvalidValueLength);
        }
        let mut att: Vec<u8, { 3 + MAX_VALUE_LENGTH }> = Vec::new();
        let _ = att.push(pdu::WRITE_REQUEST);
        let _ = att.extend_from_slice(&handle.to_le_bytes());
        let _ = att.extend_from_slice(value);
        self.send_att(connection, &att)
    }

    /// Enable notifications or indications on a remote characteristic by
    /// writing its Client Characteristic Configuration Descriptor
    /// (declaration handle + 2).
    pub fn subscribe_characteristic(
        &mut self,
        connection: u16,
        char_handle: u16,
        kind: Subscription,
    ) -> Result<(), GattError> {
        self.write_characteristic(connection, char_handle + 2, &(kind as u16).to_le_bytes())
    }

    /// Disable notifications and indications on a remote characteristic.
    pub fn unsubscribe_characteristic(
        &mut self,
        connection: u16,
        char_handle: u16,
    ) -> Result<(), GattError> {
        self.write_characteristic(connection, char_handle + 2, &[0x00, 0x00])
    }

    /// Wrap an ATT PDU in L2CAP and submit it on the ACL channel.
    pub(crate) fn send_att(&mut self, connection: u16, att_pdu: &[u8]) -> Result<(), GattError> {
        let mut payload = [0u8; TX_BUFFER_SIZE];
        let len = att::l2cap_wrap(att_pdu, &mut payload).ok_or(GattError::InsufficientResources)?;
        self.hci
            .submit_acl(connection, &payload[..len])
            .map_err(|_| GattError::InsufficientResources)
    }

    fn send_error_response(&mut self, connection: u16, request_opcode: u8, handle: u16, err: GattError) {
        let h = handle.to_le_bytes();
        let rsp = [pdu::ERROR_RESPONSE, request_opcode, h[0], h[1], err.att_code()];
        if self.send_att(connection, &rsp).is_err() {
            warn!("failed to send att error response");
        }
    }

    fn emit_gatt(&self, event: GattEvent<'_>) {
        if let Some(callback) = self.gatt_callback {
            callback(&event);
        }
    }

    /// The negotiated MTU for a connection, or the protocol default.
    fn att_mtu(&self, connection: u16) -> u16 {
        match &self.connection {
            Some(c) if c.handle == connection && c.connected => c.att_mtu,
            _ => ATT_DEFAULT_MTU,
        }
    }

    fn set_att_mtu(&mut self, connection: u16, mtu: u16) {
        if let Some(c) = self.connection.as_mut() {
            if c.handle == connection {
                c.att_mtu = mtu;
            }
        }
    }

    /// Dispatch one inbound ATT PDU, keyed on its first byte.
    pub(crate) fn process_att(&mut self, connection: u16, packet: &[u8]) {
        let Some(&opcode) = packet.first() else {
            return;
        };
        let payload = &packet[1..];

        match opcode {
            pdu::ERROR_RESPONSE => {
                if payload.len() < 4 {
                    return;
                }
                self.emit_gatt(GattEvent::ErrorResponse {
                    connection,
                    request_opcode: payload[0],
                    handle: payload[1] as u16 | (payload[2] as u16) << 8,
                    error_code: payload[3],
                });
            }
            pdu::EXCHANGE_MTU_REQUEST => self.on_mtu_request(connection, payload),
            pdu::EXCHANGE_MTU_RESPONSE => {
                if payload.len() < 2 {
                    return;
                }
                let server_mtu = payload[0] as u16 | (payload[1] as u16) << 8;
                let mtu = server_mtu.min(ATT_SERVER_MTU).max(ATT_DEFAULT_MTU);
                self.set_att_mtu(connection, mtu);
                self.emit_gatt(GattEvent::MtuExchanged { connection, mtu });
            }
            pdu::READ_BY_TYPE_REQUEST => self.on_read_by_type_request(connection, payload),
            pdu::READ_BY_TYPE_RESPONSE => self.on_read_by_type_response(connection, payload),
            pdu::READ_REQUEST => self.on_read_request(connection, payload),
            pdu::READ_RESPONSE => {
                self.emit_gatt(GattEvent::ReadResponse {
                    connection,
                    value: payload,
                });
            }
            pdu::READ_BY_GROUP_TYPE_REQUEST => self.on_read_by_group_request(connection, payload),
            pdu::READ_BY_GROUP_TYPE_RESPONSE => {
                self.on_read_by_group_response(connection, payload)
            }
            pdu::WRITE_REQUEST => self.on_write(connection, payload, true),
            pdu::WRITE_COMMAND => self.on_write(connection, payload, false),
            pdu::WRITE_RESPONSE => {
                self.emit_gatt(GattEvent::WriteResponse { connection });
            }
            pdu::FIND_INFORMATION_REQUEST => {
                // No descriptors beyond the implicit declarations.
                self.send_error_response(
                    connection,
                    opcode,
                    first_handle(payload),
                    GattError::AttributeNotFound,
                );
            }
            pdu::FIND_INFORMATION_RESPONSE => {
                self.emit_gatt(GattEvent::FindInformationResponse {
                    connection,
                    data: payload,
                });
            }
            pdu::FIND_BY_TYPE_VALUE_RESPONSE => {
                self.emit_gatt(GattEvent::FindByTypeValueResponse {
                    connection,
                    data: payload,
                });
            }
            pdu::HANDLE_VALUE_NOTIFICATION => {
                if payload.len() < 2 {
                    return;
                }
                self.emit_gatt(GattEvent::Notification {
                    connection,
                    handle: payload[0] as u16 | (payload[1] as u16) << 8,
                    value: &payload[2..],
                });
            }
            pdu::HANDLE_VALUE_INDICATION => {
                if payload.len() < 2 {
                    return;
                }
                // Confirm before the application sees the event.
                if self
                    .send_att(connection, &[pdu::HANDLE_VALUE_CONFIRMATION])
                    .is_err()
                {
                    warn!("failed to confirm indication");
                }
                self.emit_gatt(GattEvent::Indication {
                    connection,
                    handle: payload[0] as u16 | (payload[1] as u16) << 8,
                    value: &payload[2..],
                });
            }
            pdu::HANDLE_VALUE_CONFIRMATION => {
                self.indication_pending = false;
                self.emit_gatt(GattEvent::IndicationConfirmed { connection });
            }
            pdu::FIND_BY_TYPE_VALUE_REQUEST
            | pdu::READ_BLOB_REQUEST
            | pdu::READ_MULTIPLE_REQUEST
            | pdu::PREPARE_WRITE_REQUEST
            | pdu::EXECUTE_WRITE_REQUEST
            | pdu::SIGNED_WRITE_COMMAND => {
                self.send_error_response(
                    connection,
                    opcode,
                    first_handle(payload),
                    GattError::RequestNotSupported,
                );
            }
            _ => {
                self.emit_gatt(GattEvent::Unknown {
                    connection,
                    opcode,
                    payload,
                });
            }
        }
    }

    /* Server-side request handlers -------------------------------------- */

    fn on_mtu_request(&mut self, connection: u16, payload: &[u8]) {
        if payload.len() < 2 {
            self.send_error_response(
                connection,
                pdu::EXCHANGE_MTU_REQUEST,
                0,
                GattError::InvalidPdu,
            );
            return;
        }
        let client_mtu = payload[0] as u16 | (payload[1] as u16) << 8;
        let mtu = client_mtu.min(ATT_SERVER_MTU).max(ATT_DEFAULT_MTU);
        self.set_att_mtu(connection, mtu);

        let m = ATT_SERVER_MTU.to_le_bytes();
        if self
            .send_att(connection, &[pdu::EXCHANGE_MTU_RESPONSE, m[0], m[1]])
            .is_err()
        {
            warn!("failed to answer mtu exchange");
            return;
        }
        self.emit_gatt(GattEvent::MtuExchanged { connection, mtu });
    }

    fn on_read_request(&mut self, connection: u16, payload: &[u8]) {
        if payload.len() < 2 {
            self.send_error_response(connection, pdu::READ_REQUEST, 0, GattError::InvalidPdu);
            return;
        }
        let handle = payload[0] as u16 | (payload[1] as u16) << 8;

        let response: Result<Vec<u8, { 1 + MAX_VALUE_LENGTH }>, GattError> = {
            match self.db.characteristic_by_handle(handle) {
                Some(c) if c.value_handle == handle => {
                    if c.properties & prop::READ == 0 || c.permissions & perm::READ == 0 {
                        Err(GattError::ReadNotPermitted)
                    } else {
                        let mtu = self.att_mtu(connection) as usize;
                        let mut rsp = Vec::new();
                        let _ = rsp.push(pdu::READ_RESPONSE);
                        let take = c.value().len().min(mtu - 1);
                        let _ = rsp.extend_from_slice(&c.value()[..take]);
                        Ok(rsp)
                    }
                }
                Some(_) => Err(GattError::ReadNotPermitted),
                None => Err(GattError::InvalidHandle),
            }
        };

        match response {
            Ok(rsp) => {
                if self.send_att(connection, &rsp).is_err() {
                    warn!("failed to answer read request");
                    return;
                }
                self.emit_gatt(GattEvent::ReadRequest { connection, handle });
            }
            Err(err) => self.send_error_response(connection, pdu::READ_REQUEST, handle, err),
        }
    }

    fn on_write(&mut self, connection: u16, payload: &[u8], respond: bool) {
        let request_opcode = if respond {
            pdu::WRITE_REQUEST
        } else {
            pdu::WRITE_COMMAND
        };
        if payload.len() < 2 {
            if respond {
                self.send_error_response(connection, request_opcode, 0, GattError::InvalidPdu);
            }
            return;
        }
        let handle = payload[0] as u16 | (payload[1] as u16) << 8;
        let value = &payload[2..];

        let outcome = match self.db.characteristic_by_handle_mut(handle) {
            Some(c) if c.value_handle == handle => {
                if c.properties & (prop::WRITE | prop::WRITE_NO_RESP) == 0
                    || c.permissions & perm::WRITE == 0
                {
                    Err(GattError::WriteNotPermitted)
                } else if value.len() > MAX_VALUE_LENGTH {
                    Err(GattError::InvalidValueLength)
                } else {
                    c.value.clear();
                    let _ = c.value.extend_from_slice(value);
                    Ok(())
                }
            }
            Some(_) => Err(GattError::WriteNotPermitted),
            None => Err(GattError::InvalidHandle),
        };

        match outcome {
            Ok(()) => {
                if respond && self.send_att(connection, &[pdu::WRITE_RESPONSE]).is_err() {
                    warn!("failed to answer write request");
                    return;
                }
                self.emit_gatt(GattEvent::WriteRequest {
                    connection,
                    handle,
                    value,
                });
            }
            Err(err) => {
                if respond {
                    self.send_error_response(connection, request_opcode, handle, err);
                }
            }
        }
    }

    /// Service discovery against the local table (Read By Group Type,
    /// UUID 0x2800). Entries are `[start][end][uuid16]`, 6 bytes each.
    fn on_read_by_group_request(&mut self, connection: u16, payload: &[u8]) {
        if payload.len() < 6 {
            self.send_error_response(
                connection,
                pdu::READ_BY_GROUP_TYPE_REQUEST,
                0,
                GattError::InvalidPdu,
            );
            return;
        }
        let start = payload[0] as u16 | (payload[1] as u16) << 8;
        let end = payload[2] as u16 | (payload[3] as u16) << 8;
        let group = payload[4] as u16 | (payload[5] as u16) << 8;

        if group != att::uuid::PRIMARY_SERVICE {
            self.send_error_response(
                connection,
                pdu::READ_BY_GROUP_TYPE_REQUEST,
                start,
                GattError::UnsupportedGroupType,
            );
            return;
        }

        let mtu = self.att_mtu(connection) as usize;
        let mut rsp: Vec<u8, { 2 + 6 * MAX_SERVICES }> = Vec::new();
        let _ = rsp.push(pdu::READ_BY_GROUP_TYPE_RESPONSE);
        let _ = rsp.push(6);
        for service in self.db.services() {
            if !service.is_primary || service.handle < start || service.handle > end {
                continue;
            }
            if rsp.len() + 6 > mtu {
                break;
            }
            let _ = rsp.extend_from_slice(&service.handle.to_le_bytes());
            let _ = rsp.extend_from_slice(&service.end_handle.to_le_bytes());
            let _ = rsp.extend_from_slice(&service.uuid.to_le_bytes());
        }

        if rsp.len() == 2 {
            self.send_error_response(
                connection,
                pdu::READ_BY_GROUP_TYPE_REQUEST,
                start,
                GattError::AttributeNotFound,
            );
            return;
        }
        if self.send_att(connection, &rsp).is_err() {
            warn!("failed to answer service discovery");
        }
    }

    /// Characteristic discovery against the local table (Read By Type,
    /// UUID 0x2803). Entries are `[decl][props][value][uuid16]`, 7 bytes.
    fn on_read_by_type_request(&mut self, connection: u16, payload: &[u8]) {
        if payload.len() < 6 {
            self.send_error_response(
                connection,
                pdu::READ_BY_TYPE_REQUEST,
                0,
                GattError::InvalidPdu,
            );
            return;
        }
        let start = payload[0] as u16 | (payload[1] as u16) << 8;
        let end = payload[2] as u16 | (payload[3] as u16) << 8;
        let attr_type = payload[4] as u16 | (payload[5] as u16) << 8;

        if attr_type != att::uuid::CHARACTERISTIC {
            self.send_error_response(
                connection,
                pdu::READ_BY_TYPE_REQUEST,
                start,
                GattError::RequestNotSupported,
            );
            return;
        }

        let mtu = self.att_mtu(connection) as usize;
        let mut rsp: Vec<u8, { 2 + 7 * MAX_SERVICES * MAX_CHARACTERISTICS }> = Vec::new();
        let _ = rsp.push(pdu::READ_BY_TYPE_RESPONSE);
        let _ = rsp.push(7);
        for service in self.db.services() {
            for c in service.characteristics() {
                if c.handle < start || c.handle > end {
                    continue;
                }
                if rsp.len() + 7 > mtu {
                    break;
                }
                let _ = rsp.extend_from_slice(&c.handle.to_le_bytes());
                let _ = rsp.push(c.properties);
                let _ = rsp.extend_from_slice(&c.value_handle.to_le_bytes());
                let _ = rsp.extend_from_slice(&c.uuid.to_le_bytes());
            }
        }

        if rsp.len() == 2 {
            self.send_error_response(
                connection,
                pdu::READ_BY_TYPE_REQUEST,
                start,
                GattError::AttributeNotFound,
            );
            return;
        }
        if self.send_att(connection, &rsp).is_err() {
            warn!("failed to answer characteristic discovery");
        }
    }

    /* Client-side response handlers ------------------------------------- */

    /// Primary service discovery results: `[len][tuples...]`, each tuple
    /// `[start][end][uuid...]`; only 6-byte tuples (16-bit UUIDs) are
    /// decoded.
    fn on_read_by_group_response(&mut self, connection: u16, payload: &[u8]) {
        let Some(&entry_len) = payload.first() else {
            return;
        };
        if entry_len < 6 {
            return;
        }

        let mut rest = &payload[1..];
        while rest.len() >= entry_len as usize {
            let (entry, tail) = rest.split_at(entry_len as usize);
            rest = tail;
            self.emit_gatt(GattEvent::ServiceDiscovered {
                connection,
                start_handle: entry[0] as u16 | (entry[1] as u16) << 8,
                end_handle: entry[2] as u16 | (entry[3] as u16) << 8,
                uuid: entry[4] as u16 | (entry[5] as u16) << 8,
                is_primary: true,
            });
        }
    }

    /// Characteristic discovery results; the raw payload is surfaced and
    /// 7-byte tuples (16-bit UUIDs) additionally decode into
    /// `CharacteristicDiscovered` events.
    fn on_read_by_type_response(&mut self, connection: u16, payload: &[u8]) {
        self.emit_gatt(GattEvent::ReadByTypeResponse {
            connection,
            data: payload,
        });

        let Some(&entry_len) = payload.first() else {
            return;
        };
        if entry_len != 7 {
            return;
        }

        let mut rest = &payload[1..];
        while rest.len() >= 7 {
            let (entry, tail) = rest.split_at(7);
            rest = tail;
            self.emit_gatt(GattEvent::CharacteristicDiscovered {
                connection,
                handle: entry[0] as u16 | (entry[1] as u16) << 8,
                properties: entry[2],
                value_handle: entry[3] as u16 | (entry[4] as u16) << 8,
                uuid: entry[5] as u16 | (entry[6] as u16) << 8,
            });
        }
    }
}

/// Best-effort handle extraction for error responses to malformed or
/// unsupported requests.
fn first_handle(payload: &[u8]) -> u16 {
    if payload.len() >= 2 {
        payload[0] as u16 | (payload[1] as u16) << 8
    } else {
        0
    }
}

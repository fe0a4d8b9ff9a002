//! Admin command wire format and serial allocation
//!
//! Every command on the admin fiber is a little-endian header
//! `{serial: u32, command_id: u32, payload_len: u32}` followed by the
//! payload bytes. A reply reuses the request's serial with the reply
//! command id.

use super::AdminError;
use crate::fiber::FiberReadHalf;

/// Command header size in bytes
pub const COMMAND_HEADER_SIZE: usize = 12;

/// Upper bound on a command payload
pub const MAX_COMMAND_PAYLOAD: usize = 1024 * 1024;

/// One admin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    pub serial: u32,
    pub command_id: u32,
    pub payload: Vec<u8>,
}

impl AdminCommand {
    pub fn new(serial: u32, command_id: u32, payload: Vec<u8>) -> Self {
        Self {
            serial,
            command_id,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMMAND_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.serial.to_le_bytes());
        buf.extend_from_slice(&self.command_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

async fn read_exact_fiber(half: &mut FiberReadHalf, buf: &mut [u8]) -> Result<(), AdminError> {
    let mut offset = 0;
    while offset < buf.len() {
        let n = half.read(&mut buf[offset..]).await?;
        if n == 0 {
            return Err(AdminError::Closed);
        }
        offset += n;
    }
    Ok(())
}

/// Read one command from the admin fiber.
pub async fn read_command(half: &mut FiberReadHalf) -> Result<AdminCommand, AdminError> {
    let mut header = [0u8; COMMAND_HEADER_SIZE];
    read_exact_fiber(half, &mut header).await?;

    let serial = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let command_id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

    if payload_len > MAX_COMMAND_PAYLOAD {
        return Err(AdminError::PayloadTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    read_exact_fiber(half, &mut payload).await?;

    Ok(AdminCommand {
        serial,
        command_id,
        payload,
    })
}

/// Allocates command serials from a parity-partitioned space so the two
/// peers never collide: the client draws odd serials starting at 3, the
/// server even serials starting at 4. Serials whose reply handler is still
/// registered are skipped; the counter wraps back to the base.
#[derive(Debug)]
pub struct SerialAllocator {
    next: u32,
    base: u32,
}

impl SerialAllocator {
    pub fn new_client() -> Self {
        Self { next: 3, base: 3 }
    }

    pub fn new_server() -> Self {
        Self { next: 4, base: 4 }
    }

    /// Allocate the next free serial. `is_used` reports whether a reply
    /// handler is still registered for a serial.
    pub fn allocate(&mut self, is_used: impl Fn(u32) -> bool) -> u32 {
        loop {
            let serial = self.next;
            self.next = match self.next.checked_add(2) {
                Some(next) => next,
                None => self.base,
            };
            if !is_used(serial) {
                return serial;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_command_byte_layout() {
        let cmd = AdminCommand::new(0x0102_0304, 7, b"payload".to_vec());
        let encoded = cmd.encode();

        assert_eq!(&encoded[0..4], &[0x04, 0x03, 0x02, 0x01]); // serial LE
        assert_eq!(&encoded[4..8], &[7, 0, 0, 0]); // command id LE
        assert_eq!(&encoded[8..12], &[7, 0, 0, 0]); // payload len LE
        assert_eq!(&encoded[12..], b"payload");
    }

    #[test]
    fn test_serial_parity_partition() {
        let mut client = SerialAllocator::new_client();
        let mut server = SerialAllocator::new_server();
        let none = |_| false;

        let client_serials: Vec<u32> = (0..4).map(|_| client.allocate(none)).collect();
        let server_serials: Vec<u32> = (0..4).map(|_| server.allocate(none)).collect();

        assert_eq!(client_serials, vec![3, 5, 7, 9]);
        assert_eq!(server_serials, vec![4, 6, 8, 10]);
        assert!(client_serials.iter().all(|s| s % 2 == 1));
        assert!(server_serials.iter().all(|s| s % 2 == 0));
    }

    #[test]
    fn test_serial_skips_in_use() {
        let mut alloc = SerialAllocator::new_client();
        let mut used = HashSet::new();
        used.insert(3u32);
        used.insert(5u32);

        let serial = alloc.allocate(|s| used.contains(&s));
        assert_eq!(serial, 7);
    }

    #[test]
    fn test_serial_wraps_to_base() {
        let mut alloc = SerialAllocator::new_client();
        alloc.next = u32::MAX; // odd
        assert_eq!(alloc.allocate(|_| false), u32::MAX);
        assert_eq!(alloc.allocate(|_| false), 3);
    }
}

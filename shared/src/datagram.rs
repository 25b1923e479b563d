//! Little-endian datagram builder and reader.
//!
//! Server datagram layout:
//!
//! ```text
//! [recipientCount:u8][recipient:u64]*N [sender:u64][msgType:u16][payload...]
//! ```
//!
//! Control datagrams address the broker itself and carry a recipient count of
//! zero followed directly by `msgType` and the payload.

use crate::channel::Channel;
use thiserror::Error;

/// Errors raised while reading or writing datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatagramError {
    /// The datagram ended before the value could be read.
    #[error("truncated datagram: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A string field held bytes that are not valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8,

    /// A length-prefixed value does not fit its u16 prefix.
    #[error("value of {0} bytes exceeds the u16 length prefix")]
    TooLong(usize),

    /// More recipients than the u8 count can express.
    #[error("{0} recipients exceed the u8 recipient count")]
    TooManyRecipients(usize),
}

/// An owned, growable datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datagram {
    data: Vec<u8>,
}

impl Datagram {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Starts a server datagram addressed to `recipients`.
    pub fn server(recipients: &[Channel], sender: Channel, msg_type: u16) -> Self {
        let mut dg = Self::new();
        dg.add_server_header(recipients, sender, msg_type);
        dg
    }

    /// Starts a control datagram addressed to the broker.
    pub fn control(msg_type: u16) -> Self {
        let mut dg = Self::new();
        dg.add_control_header(msg_type);
        dg
    }

    /// Appends a server header.
    ///
    /// At most 255 recipients fit the count byte. Debug builds panic past
    /// that and release builds drop the extras; use [`Datagram::try_server`]
    /// when the count is not known to fit.
    pub fn add_server_header(&mut self, recipients: &[Channel], sender: Channel, msg_type: u16) {
        debug_assert!(
            recipients.len() <= u8::MAX as usize,
            "{} recipients do not fit a server header",
            recipients.len()
        );
        let count = recipients.len().min(u8::MAX as usize);
        self.add_u8(count as u8);
        for recipient in &recipients[..count] {
            self.add_channel(*recipient);
        }
        self.add_channel(sender);
        self.add_u16(msg_type);
    }

    pub fn try_server(
        recipients: &[Channel],
        sender: Channel,
        msg_type: u16,
    ) -> Result<Self, DatagramError> {
        if recipients.len() > u8::MAX as usize {
            return Err(DatagramError::TooManyRecipients(recipients.len()));
        }
        Ok(Self::server(recipients, sender, msg_type))
    }

    pub fn add_control_header(&mut self, msg_type: u16) {
        self.add_u8(0);
        self.add_u16(msg_type);
    }

    pub fn add_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i8(&mut self, value: i8) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i16(&mut self, value: i16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_channel(&mut self, channel: Channel) {
        self.add_u64(channel);
    }

    /// Appends `bytes` behind a u16 length prefix.
    pub fn add_blob16(&mut self, bytes: &[u8]) -> Result<(), DatagramError> {
        let len = u16::try_from(bytes.len()).map_err(|_| DatagramError::TooLong(bytes.len()))?;
        self.add_u16(len);
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn add_string16(&mut self, value: &str) -> Result<(), DatagramError> {
        self.add_blob16(value.as_bytes())
    }

    /// Appends raw bytes with no prefix.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Overwrites two bytes at `pos` with `value`, for back-patched counts.
    pub fn patch_u16(&mut self, pos: usize, value: u16) {
        if let Some(slot) = self.data.get_mut(pos..pos + 2) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Current write position.
    pub fn tell(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn iter(&self) -> DatagramIterator<'_> {
        DatagramIterator::new(&self.data)
    }
}

/// Parsed routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramHeader {
    Control {
        msg_type: u16,
    },
    Server {
        recipients: Vec<Channel>,
        sender: Channel,
        msg_type: u16,
    },
}

impl DatagramHeader {
    pub fn msg_type(&self) -> u16 {
        match self {
            DatagramHeader::Control { msg_type } => *msg_type,
            DatagramHeader::Server { msg_type, .. } => *msg_type,
        }
    }

    /// Sender channel; control datagrams have none.
    pub fn sender(&self) -> Option<Channel> {
        match self {
            DatagramHeader::Control { .. } => None,
            DatagramHeader::Server { sender, .. } => Some(*sender),
        }
    }
}

/// Cursor over a borrowed datagram.
#[derive(Debug, Clone)]
pub struct DatagramIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DatagramIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reads the routing header from the current position.
    pub fn read_header(&mut self) -> Result<DatagramHeader, DatagramError> {
        let count = self.get_u8()?;
        if count == 0 {
            let msg_type = self.get_u16()?;
            return Ok(DatagramHeader::Control { msg_type });
        }

        let mut recipients = Vec::with_capacity(count as usize);
        for _ in 0..count {
            recipients.push(self.get_channel()?);
        }
        let sender = self.get_channel()?;
        let msg_type = self.get_u16()?;

        Ok(DatagramHeader::Server {
            recipients,
            sender,
            msg_type,
        })
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DatagramError> {
        let bytes = self.get_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, DatagramError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DatagramError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn get_u32(&mut self) -> Result<u32, DatagramError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, DatagramError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    pub fn get_i8(&mut self) -> Result<i8, DatagramError> {
        Ok(i8::from_le_bytes(self.take()?))
    }

    pub fn get_i16(&mut self) -> Result<i16, DatagramError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    pub fn get_i32(&mut self) -> Result<i32, DatagramError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, DatagramError> {
        Ok(i64::from_le_bytes(self.take()?))
    }

    pub fn get_channel(&mut self) -> Result<Channel, DatagramError> {
        self.get_u64()
    }

    /// Reads a u16 length prefix and that many bytes.
    pub fn get_blob16(&mut self) -> Result<&'a [u8], DatagramError> {
        let len = self.get_u16()? as usize;
        self.get_bytes(len)
    }

    pub fn get_string16(&mut self) -> Result<String, DatagramError> {
        let bytes = self.get_blob16()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DatagramError::InvalidUtf8)
    }

    /// Reads exactly `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], DatagramError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(DatagramError::Truncated {
                needed: len,
                remaining,
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Unread bytes, without advancing.
    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Moves the cursor, clamped to the end of the datagram.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    /// Bytes consumed between `start` and the current position.
    pub fn slice_from(&self, start: usize) -> &'a [u8] {
        &self.data[start.min(self.pos)..self.pos]
    }
}

/// Lowercase hex rendering for log lines.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_header_layout() {
        let dg = Datagram::server(&[4002], 4_000_000, 2004);
        let bytes = dg.as_bytes();

        assert_eq!(bytes.len(), 1 + 8 + 8 + 2);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..9], &4002u64.to_le_bytes());
        assert_eq!(&bytes[9..17], &4_000_000u64.to_le_bytes());
        assert_eq!(&bytes[17..19], &2004u16.to_le_bytes());
    }

    #[test]
    fn test_read_server_header() {
        let mut dg = Datagram::server(&[1, 2, 3], 99, 2009);
        dg.add_u32(77);

        let mut dgi = dg.iter();
        let header = dgi.read_header().unwrap();

        assert_eq!(
            header,
            DatagramHeader::Server {
                recipients: vec![1, 2, 3],
                sender: 99,
                msg_type: 2009,
            }
        );
        assert_eq!(header.sender(), Some(99));
        assert_eq!(dgi.get_u32().unwrap(), 77);
        assert_eq!(dgi.remaining(), 0);
    }

    #[test]
    fn test_control_header() {
        let mut dg = Datagram::control(9000);
        dg.add_channel(4_000_000);

        assert_eq!(dg.as_bytes()[0], 0);

        let mut dgi = dg.iter();
        let header = dgi.read_header().unwrap();
        assert_eq!(header, DatagramHeader::Control { msg_type: 9000 });
        assert_eq!(header.sender(), None);
        assert_eq!(dgi.get_channel().unwrap(), 4_000_000);
    }

    #[test]
    fn test_signed_and_unsigned_values() {
        let mut dg = Datagram::new();
        dg.add_u8(200);
        dg.add_i8(-5);
        dg.add_u16(65_000);
        dg.add_i16(-300);
        dg.add_i32(-70_000);
        dg.add_i64(i64::MIN);

        let mut dgi = dg.iter();
        assert_eq!(dgi.get_u8().unwrap(), 200);
        assert_eq!(dgi.get_i8().unwrap(), -5);
        assert_eq!(dgi.get_u16().unwrap(), 65_000);
        assert_eq!(dgi.get_i16().unwrap(), -300);
        assert_eq!(dgi.get_i32().unwrap(), -70_000);
        assert_eq!(dgi.get_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn test_string16() {
        let mut dg = Datagram::new();
        dg.add_string16("Sillyville").unwrap();

        assert_eq!(&dg.as_bytes()[..2], &10u16.to_le_bytes());
        assert_eq!(dg.iter().get_string16().unwrap(), "Sillyville");
    }

    #[test]
    fn test_invalid_utf8() {
        let mut dg = Datagram::new();
        dg.add_blob16(&[0xff, 0xfe]).unwrap();

        assert_eq!(dg.iter().get_string16(), Err(DatagramError::InvalidUtf8));
    }

    #[test]
    fn test_blob_too_long() {
        let mut dg = Datagram::new();
        let big = vec![0u8; u16::MAX as usize + 1];

        assert_eq!(dg.add_blob16(&big), Err(DatagramError::TooLong(big.len())));
        assert!(dg.is_empty());
    }

    #[test]
    fn test_truncated_read() {
        let dg = Datagram::from_bytes(vec![1, 2, 3]);
        let mut dgi = dg.iter();

        assert_eq!(
            dgi.get_u32(),
            Err(DatagramError::Truncated {
                needed: 4,
                remaining: 3,
            })
        );
        // A failed read does not advance the cursor.
        assert_eq!(dgi.tell(), 0);
    }

    #[test]
    fn test_truncated_header() {
        let dg = Datagram::from_bytes(vec![2, 0, 0, 0]);
        assert!(dg.iter().read_header().is_err());
    }

    #[test]
    fn test_patch_u16() {
        let mut dg = Datagram::new();
        dg.add_u32(1);
        let pos = dg.tell();
        dg.add_u16(0);
        dg.add_u8(9);
        dg.patch_u16(pos, 3);

        let mut dgi = dg.iter();
        dgi.get_u32().unwrap();
        assert_eq!(dgi.get_u16().unwrap(), 3);
        assert_eq!(dgi.get_u8().unwrap(), 9);
    }

    #[test]
    fn test_slice_from_and_seek() {
        let mut dg = Datagram::new();
        dg.add_u16(5);
        dg.add_u32(6);

        let mut dgi = dg.iter();
        dgi.get_u16().unwrap();
        let start = dgi.tell();
        dgi.get_u32().unwrap();
        assert_eq!(dgi.slice_from(start), &6u32.to_le_bytes());

        dgi.seek(0);
        assert_eq!(dgi.remaining_bytes(), dg.as_bytes());
        dgi.seek(100);
        assert_eq!(dgi.remaining(), 0);
    }

    #[test]
    fn test_too_many_recipients() {
        let recipients: Vec<Channel> = (0..300).collect();
        assert_eq!(
            Datagram::try_server(&recipients, 1, 2),
            Err(DatagramError::TooManyRecipients(300))
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "do not fit a server header")]
    fn test_oversized_server_header_panics_in_debug() {
        let recipients: Vec<Channel> = (0..256).collect();
        Datagram::server(&recipients, 1, 2);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}

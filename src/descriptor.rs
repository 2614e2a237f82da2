//! Flow-control descriptor exchanged during a port handshake.
//!
//! The wire form is 248 bytes, little-endian, with the field offsets below.
//! Containers built independently must agree on it byte for byte.
//!
//! | off | field | type |
//! |---|---|---|
//! | 0 | type | u32 |
//! | 4 | role | u32 |
//! | 8 | options | u32 |
//! | 16 | n_buffers | u32 |
//! | 24 | data_buffer_base | u64 |
//! | 32 | data_buffer_pitch | u32 |
//! | 36 | data_buffer_size | u32 |
//! | 40 | metadata_base | u64 |
//! | 48 | metadata_pitch | u32 |
//! | 56 | full_flag_base | u64 |
//! | 64 | full_flag_size | u32 |
//! | 68 | full_flag_pitch | u32 |
//! | 72 | full_flag_value | u64 |
//! | 80 | empty_flag_base | u64 |
//! | 88 | empty_flag_size | u32 |
//! | 92 | empty_flag_pitch | u32 |
//! | 96 | empty_flag_value | u64 |
//! | 104 | oob.port_id | u64 |
//! | 112 | oob.endpoint | [u8; 128] |
//! | 240 | oob.cookie | u64 |
//!
//! Bytes 12, 20 and 52 are padding and always zero.

use crate::error::{Error, Result};
use crate::port::MAX_BUFFERS;

/// Encoded size of a descriptor.
pub const DESCRIPTOR_SIZE: usize = 248;

/// Capacity of the out-of-band endpoint string, including its NUL terminator.
pub const OOB_ENDPOINT_LEN: usize = 128;

/// Option bits of a consumer descriptor holding the number of parts each
/// produced buffer is split into. Zero means one.
pub const OPTION_PARTS_MASK: u32 = 0xff;

/// Which side of a connection a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DescriptorType {
    /// An output port.
    Producer = 0,
    /// An input port that does not drive flow control.
    Consumer = 1,
    /// An input port that writes empty flags back to the producer.
    ConsumerFlowControl = 2,
}

impl TryFrom<u32> for DescriptorType {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Producer),
            1 => Ok(Self::Consumer),
            2 => Ok(Self::ConsumerFlowControl),
            _ => Err(Error::DescriptorMismatch(format!("unknown descriptor type {v}"))),
        }
    }
}

/// Data-movement role a port advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DescriptorRole {
    /// Sender pushes data and flags.
    ActiveMessage = 0,
    /// Only flags are pushed; data is pulled.
    ActiveFlowControl = 1,
    /// Sender pushes data without flow control.
    ActiveOnly = 2,
    /// The port never initiates transfers.
    Passive = 3,
    /// Sentinel: no role negotiated.
    MaxRole = 4,
}

impl TryFrom<u32> for DescriptorRole {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::ActiveMessage),
            1 => Ok(Self::ActiveFlowControl),
            2 => Ok(Self::ActiveOnly),
            3 => Ok(Self::Passive),
            4 => Ok(Self::MaxRole),
            _ => Err(Error::DescriptorMismatch(format!("unknown descriptor role {v}"))),
        }
    }
}

/// A port's flow-control description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Producer or consumer.
    pub kind: DescriptorType,
    /// Negotiated role.
    pub role: DescriptorRole,
    /// Option bits; consumers carry their part count under [`OPTION_PARTS_MASK`].
    pub options: u32,
    /// Number of buffers.
    pub n_buffers: u32,
    /// Offset of buffer 0's data.
    pub data_buffer_base: u64,
    /// Distance between consecutive data buffers.
    pub data_buffer_pitch: u32,
    /// Usable bytes per data buffer.
    pub data_buffer_size: u32,
    /// Offset of buffer 0's metadata.
    pub metadata_base: u64,
    /// Distance between consecutive metadata records.
    pub metadata_pitch: u32,
    /// Offset of the full-flag array.
    pub full_flag_base: u64,
    /// Size of one full flag.
    pub full_flag_size: u32,
    /// Distance between consecutive buffers' full flags.
    pub full_flag_pitch: u32,
    /// Value marking "full".
    pub full_flag_value: u64,
    /// Offset of the empty-flag array.
    pub empty_flag_base: u64,
    /// Size of one empty flag.
    pub empty_flag_size: u32,
    /// Distance between consecutive empty flags.
    pub empty_flag_pitch: u32,
    /// Value marking "empty".
    pub empty_flag_value: u64,
    /// Ordinal of the port within its worker.
    pub port_id: u64,
    /// Endpoint the port's memory lives in.
    pub endpoint: String,
    /// Opaque cookie; conduit stores the port's rank within its set.
    pub cookie: u64,
}

fn put_u32(buf: &mut [u8; DESCRIPTOR_SIZE], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8; DESCRIPTOR_SIZE], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

impl Descriptor {
    /// Encode into the 248-byte wire form.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint string does not fit in 127 bytes.
    pub fn encode(&self) -> Result<[u8; DESCRIPTOR_SIZE]> {
        if self.endpoint.len() >= OOB_ENDPOINT_LEN {
            return Err(Error::DescriptorMismatch(format!(
                "endpoint string of {} bytes does not fit the descriptor",
                self.endpoint.len()
            )));
        }
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        put_u32(&mut buf, 0, self.kind as u32);
        put_u32(&mut buf, 4, self.role as u32);
        put_u32(&mut buf, 8, self.options);
        put_u32(&mut buf, 16, self.n_buffers);
        put_u64(&mut buf, 24, self.data_buffer_base);
        put_u32(&mut buf, 32, self.data_buffer_pitch);
        put_u32(&mut buf, 36, self.data_buffer_size);
        put_u64(&mut buf, 40, self.metadata_base);
        put_u32(&mut buf, 48, self.metadata_pitch);
        put_u64(&mut buf, 56, self.full_flag_base);
        put_u32(&mut buf, 64, self.full_flag_size);
        put_u32(&mut buf, 68, self.full_flag_pitch);
        put_u64(&mut buf, 72, self.full_flag_value);
        put_u64(&mut buf, 80, self.empty_flag_base);
        put_u32(&mut buf, 88, self.empty_flag_size);
        put_u32(&mut buf, 92, self.empty_flag_pitch);
        put_u64(&mut buf, 96, self.empty_flag_value);
        put_u64(&mut buf, 104, self.port_id);
        buf[112..112 + self.endpoint.len()].copy_from_slice(self.endpoint.as_bytes());
        put_u64(&mut buf, 240, self.cookie);
        Ok(buf)
    }

    /// Decode the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DescriptorMismatch`] on a wrong length, an unknown
    /// type or role, or an endpoint string that is unterminated or not UTF-8.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DESCRIPTOR_SIZE {
            return Err(Error::DescriptorMismatch(format!(
                "descriptor is {} bytes, expected {DESCRIPTOR_SIZE}",
                buf.len()
            )));
        }
        let oob = &buf[112..112 + OOB_ENDPOINT_LEN];
        let nul = oob
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::DescriptorMismatch("endpoint string is not terminated".into()))?;
        let endpoint = std::str::from_utf8(&oob[..nul])
            .map_err(|_| Error::DescriptorMismatch("endpoint string is not UTF-8".into()))?
            .to_string();

        Ok(Self {
            kind: DescriptorType::try_from(get_u32(buf, 0))?,
            role: DescriptorRole::try_from(get_u32(buf, 4))?,
            options: get_u32(buf, 8),
            n_buffers: get_u32(buf, 16),
            data_buffer_base: get_u64(buf, 24),
            data_buffer_pitch: get_u32(buf, 32),
            data_buffer_size: get_u32(buf, 36),
            metadata_base: get_u64(buf, 40),
            metadata_pitch: get_u32(buf, 48),
            full_flag_base: get_u64(buf, 56),
            full_flag_size: get_u32(buf, 64),
            full_flag_pitch: get_u32(buf, 68),
            full_flag_value: get_u64(buf, 72),
            empty_flag_base: get_u64(buf, 80),
            empty_flag_size: get_u32(buf, 88),
            empty_flag_pitch: get_u32(buf, 92),
            empty_flag_value: get_u64(buf, 96),
            port_id: get_u64(buf, 104),
            endpoint,
            cookie: get_u64(buf, 240),
        })
    }

    /// Check that a peer descriptor can be paired with a local one.
    ///
    /// The peer must be of the opposite direction and have between one and
    /// [`MAX_BUFFERS`] buffers. The consumer's buffers must hold the
    /// producer's buffer, or one part of it when the consumer is partitioned.
    pub fn validate_against(&self, local: &Descriptor) -> Result<()> {
        let local_is_producer = local.kind == DescriptorType::Producer;
        let peer_is_producer = self.kind == DescriptorType::Producer;
        if local_is_producer == peer_is_producer {
            return Err(Error::DescriptorMismatch(format!(
                "cannot pair {:?} with {:?}",
                local.kind, self.kind
            )));
        }
        if self.n_buffers == 0 {
            return Err(Error::DescriptorMismatch("peer advertises no buffers".into()));
        }
        if self.n_buffers as usize > MAX_BUFFERS {
            return Err(Error::DescriptorMismatch(format!(
                "peer advertises {} buffers, at most {MAX_BUFFERS} are supported",
                self.n_buffers
            )));
        }
        if self.data_buffer_size == 0 {
            return Err(Error::DescriptorMismatch("peer buffers have zero size".into()));
        }
        if self.full_flag_size != 4 || self.empty_flag_size != 4 {
            return Err(Error::DescriptorMismatch(format!(
                "flag sizes {}/{} are not 4-byte words",
                self.full_flag_size, self.empty_flag_size
            )));
        }
        if self.endpoint.is_empty() {
            return Err(Error::DescriptorMismatch("peer endpoint is empty".into()));
        }
        let (producer, consumer) = if local_is_producer { (local, self) } else { (self, local) };
        let needed = producer.data_buffer_size.div_ceil(consumer.parts());
        if consumer.data_buffer_size < needed {
            return Err(Error::DescriptorMismatch(format!(
                "{}-byte producer buffers need {needed}-byte consumer buffers, peer has {}",
                producer.data_buffer_size, consumer.data_buffer_size
            )));
        }
        Ok(())
    }

    /// Parts each produced buffer is split into for this consumer.
    pub fn parts(&self) -> u32 {
        (self.options & OPTION_PARTS_MASK).max(1)
    }
}

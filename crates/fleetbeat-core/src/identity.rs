//! Node identity and its compact on-disk / on-wire record.
//!
//! Record layout (little-endian):
//!
//! ```text
//! id u32 | hostname_len u16 | region_len u16 | zone_len u16 | datacenter_len u16
//! hostname bytes | region bytes | zone bytes | datacenter bytes
//! ```
//!
//! A record cut short after the header decodes the missing strings as empty.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Id meaning "not yet assigned by a collector".
pub const UNASSIGNED: u32 = 0;

/// Who a node is. Only the id changes, and only during a handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: u32,
    pub hostname: String,
    pub region: String,
    pub zone: String,
    pub datacenter: String,
}

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct IdentityHeader {
    id: U32<LittleEndian>,
    hostname_len: U16<LittleEndian>,
    region_len: U16<LittleEndian>,
    zone_len: U16<LittleEndian>,
    datacenter_len: U16<LittleEndian>,
}

assert_eq_size!(IdentityHeader, [u8; 12]);

const IDENTITY_HEADER_LEN: usize = std::mem::size_of::<IdentityHeader>();

impl NodeIdentity {
    /// A fresh, unassigned identity for this host.
    pub fn fresh(hostname: impl Into<String>) -> Self {
        Self {
            id: UNASSIGNED,
            hostname: hostname.into(),
            ..Self::default()
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.id != UNASSIGNED
    }

    pub fn encode(&self) -> Result<Vec<u8>, IdentityError> {
        let fields = [&self.hostname, &self.region, &self.zone, &self.datacenter];
        for f in fields {
            if f.len() > u16::MAX as usize {
                return Err(IdentityError::FieldTooLong(f.len()));
            }
        }
        let header = IdentityHeader {
            id: U32::new(self.id),
            hostname_len: U16::new(self.hostname.len() as u16),
            region_len: U16::new(self.region.len() as u16),
            zone_len: U16::new(self.zone.len() as u16),
            datacenter_len: U16::new(self.datacenter.len() as u16),
        };
        let mut out = Vec::with_capacity(
            IDENTITY_HEADER_LEN + fields.iter().map(|f| f.len()).sum::<usize>(),
        );
        out.extend_from_slice(header.as_bytes());
        for f in fields {
            out.extend_from_slice(f.as_bytes());
        }
        Ok(out)
    }

    /// Returns the decoded identity; the input is never modified.
    pub fn decode(buf: &[u8]) -> Result<Self, IdentityError> {
        let header = IdentityHeader::read_from_prefix(buf).ok_or(IdentityError::Truncated(buf.len()))?;
        let mut rest = &buf[IDENTITY_HEADER_LEN..];
        let mut take = |len: u16| -> Result<String, IdentityError> {
            let len = (len as usize).min(rest.len());
            let (field, tail) = rest.split_at(len);
            rest = tail;
            String::from_utf8(field.to_vec()).map_err(|_| IdentityError::InvalidUtf8)
        };
        Ok(Self {
            id: header.id.get(),
            hostname: take(header.hostname_len.get())?,
            region: take(header.region_len.get())?,
            zone: take(header.zone_len.get())?,
            datacenter: take(header.datacenter_len.get())?,
        })
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}@{}", self.id, self.hostname)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity record too short ({0} bytes)")]
    Truncated(usize),
    #[error("identity field is not valid UTF-8")]
    InvalidUtf8,
    #[error("identity field of {0} bytes does not fit a u16 length")]
    FieldTooLong(usize),
}

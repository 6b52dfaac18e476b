//! Encoding helpers for packet bodies: length-prefixed byte runs, UTF-8 strings with a
//!  2-byte length prefix, and fixed-width scalars - all in network byte order. The
//!  protocol core treats bodies as opaque; these are for application payloads and the
//!  tests.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

pub trait PayloadWriteExt: BufMut {
    /// byte run with u16 BE length prefix
    fn put_len_prefixed(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= u16::MAX as usize);
        self.put_u16(data.len() as u16);
        self.put_slice(data);
    }

    /// UTF-8 string with u16 BE length prefix (length in bytes)
    fn put_utf8(&mut self, s: &str) {
        self.put_len_prefixed(s.as_bytes());
    }
}
impl<T: BufMut> PayloadWriteExt for T {}

pub trait PayloadReadExt: Buf + TryGetFixedSupport {
    fn try_get_len_prefixed(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = TryGetFixedSupport::try_get_u16(self)? as usize;
        if self.remaining() < len {
            bail!(
                "length prefix {} exceeds remaining buffer of {} bytes",
                len,
                self.remaining()
            );
        }
        let mut data = vec![0u8; len];
        self.copy_to_slice(&mut data);
        Ok(data)
    }

    fn try_get_utf8(&mut self) -> anyhow::Result<String> {
        let raw = self.try_get_len_prefixed()?;
        String::from_utf8(raw).map_err(|e| anyhow!("invalid UTF-8 in string payload: {}", e))
    }
}
impl<T: Buf> PayloadReadExt for T {}

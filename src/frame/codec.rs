//! Primitive readers and writers for the notation types of the native protocol
//! (`[int]`, `[string]`, `[bytes]`, ...). All integers are big-endian.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use uuid::Uuid;

use crate::{
    error::{Error, Result},
    options::Consistency,
};

/// A cursor over a frame body.
pub(crate) struct BodyReader<'a> {
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    #[allow(unused)]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::protocol(format!(
                "body ended early: wanted {} bytes, {} remain",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[allow(unused)]
    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// `[string]`: a u16 length followed by UTF-8 bytes.
    pub(crate) fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::protocol("string is not valid UTF-8"))
    }

    /// `[long string]`: an i32 length followed by UTF-8 bytes.
    pub(crate) fn read_long_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::protocol("negative long string length"));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::protocol("string is not valid UTF-8"))
    }

    /// `[bytes]`: an i32 length followed by raw bytes; a negative length means null.
    pub(crate) fn read_bytes_opt(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    /// `[short bytes]`: a u16 length followed by raw bytes.
    pub(crate) fn read_short_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub(crate) fn read_string_list(&mut self) -> Result<Vec<String>> {
        let count = self.read_u16()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    pub(crate) fn read_string_multimap(&mut self) -> Result<HashMap<String, Vec<String>>> {
        let count = self.read_u16()? as usize;
        let mut out = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let values = self.read_string_list()?;
            out.insert(key, values);
        }
        Ok(out)
    }

    pub(crate) fn read_uuid(&mut self) -> Result<Uuid> {
        let b = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(b);
        Ok(Uuid::from_bytes(bytes))
    }

    /// `[inet]`: one size byte (4 or 16), the address, then an i32 port.
    pub(crate) fn read_inet(&mut self) -> Result<SocketAddr> {
        let size = self.read_u8()? as usize;
        let ip = match size {
            4 => {
                let b = self.take(4)?;
                IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            16 => {
                let b = self.take(16)?;
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(b);
                IpAddr::V6(Ipv6Addr::from(bytes))
            }
            other => {
                return Err(Error::protocol(format!(
                    "invalid inet address length: {}",
                    other
                )))
            }
        };
        let port = self.read_i32()?;
        Ok(SocketAddr::new(ip, port as u16))
    }

    pub(crate) fn read_consistency(&mut self) -> Result<Consistency> {
        Consistency::from_u16(self.read_u16()?)
    }
}

pub(crate) fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_u16(buf, value.len() as u16);
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) fn write_long_string(buf: &mut Vec<u8>, value: &str) {
    write_i32(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) fn write_string_list(buf: &mut Vec<u8>, values: &[String]) {
    write_u16(buf, values.len() as u16);
    for value in values {
        write_string(buf, value);
    }
}

pub(crate) fn write_string_map<'a>(
    buf: &mut Vec<u8>,
    entries: impl ExactSizeIterator<Item = (&'a str, &'a str)>,
) {
    write_u16(buf, entries.len() as u16);
    for (key, value) in entries {
        write_string(buf, key);
        write_string(buf, value);
    }
}

/// `[bytes]` with null encoded as length -1.
pub(crate) fn write_bytes_opt(buf: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            write_i32(buf, bytes.len() as i32);
            buf.extend_from_slice(bytes);
        }
        None => write_i32(buf, -1),
    }
}

pub(crate) fn write_short_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    write_u16(buf, value.len() as u16);
    buf.extend_from_slice(value);
}

pub(crate) fn write_consistency(buf: &mut Vec<u8>, value: Consistency) {
    write_u16(buf, value.to_u16());
}

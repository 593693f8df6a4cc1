//! NBD wire format
//!
//! Only what a client of the fixed newstyle handshake and the simple reply transmission phase
//! needs. All integers are big endian.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_PORT: u16 = 10809;

pub const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
pub const IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
pub const OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

pub const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const FLAG_NO_ZEROES: u16 = 1 << 1;
pub const CLIENT_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const CLIENT_NO_ZEROES: u32 = 1 << 1;

pub const TRANSMISSION_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const TRANSMISSION_FLAG_READ_ONLY: u16 = 1 << 1;

pub const OPT_EXPORT_NAME: u32 = 1;
pub const OPT_GO: u32 = 7;

pub const REP_ACK: u32 = 1;
pub const REP_INFO: u32 = 3;
pub const REP_FLAG_ERROR: u32 = 1 << 31;
pub const REP_ERR_UNSUP: u32 = REP_FLAG_ERROR | 1;

pub const INFO_EXPORT: u16 = 0;
pub const INFO_BLOCK_SIZE: u16 = 3;

/// Length of the zero padding after the `NBD_OPT_EXPORT_NAME` reply, unless `NO_ZEROES` was agreed.
pub const EXPORT_NAME_PADDING: usize = 124;

pub const REQUEST_HEADER_LEN: usize = 28;
pub const REPLY_HEADER_LEN: usize = 16;

pub const EPERM: u32 = 1;
pub const EIO: u32 = 5;
pub const ENOMEM: u32 = 12;
pub const EINVAL: u32 = 22;
pub const ENOSPC: u32 = 28;
pub const EOVERFLOW: u32 = 75;
pub const ENOTSUP: u32 = 95;
pub const ESHUTDOWN: u32 = 108;

/// Errors which will come back no matter how often the request is repeated.
#[must_use]
pub fn is_fatal_error(error: u32) -> bool {
    matches!(error, EPERM | EINVAL | ENOSPC | ENOTSUP)
}

#[must_use]
pub fn error_name(error: u32) -> &'static str {
    match error {
        EPERM => "EPERM",
        EIO => "EIO",
        ENOMEM => "ENOMEM",
        EINVAL => "EINVAL",
        ENOSPC => "ENOSPC",
        EOVERFLOW => "EOVERFLOW",
        ENOTSUP => "ENOTSUP",
        ESHUTDOWN => "ESHUTDOWN",
        _ => "unknown error",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Read = 0,
    Write = 1,
    Disconnect = 2,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Command::Read => write!(f, "read"),
            Command::Write => write!(f, "write"),
            Command::Disconnect => write!(f, "disconnect"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub command: Command,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    /// Payload of a write, empty otherwise.
    pub data: Bytes,
}

impl Request {
    #[must_use]
    pub fn read(handle: u64, offset: u64, length: u32) -> Self {
        Self {
            command: Command::Read,
            handle,
            offset,
            length,
            data: Bytes::new(),
        }
    }

    #[must_use]
    pub fn write(handle: u64, offset: u64, data: Bytes) -> Self {
        Self {
            command: Command::Write,
            handle,
            offset,
            length: data.len() as u32,
            data,
        }
    }

    #[must_use]
    pub fn disconnect() -> Self {
        Self {
            command: Command::Disconnect,
            handle: 0,
            offset: 0,
            length: 0,
            data: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub handle: u64,
    pub error: u32,
    /// Payload of a successful read.
    pub data: Option<Bytes>,
}

#[derive(Debug, Default)]
pub struct RequestCodec;

impl Encoder<Request> for RequestCodec {
    type Error = std::io::Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(REQUEST_HEADER_LEN + request.data.len());
        dst.put_u32(REQUEST_MAGIC);
        dst.put_u16(0);
        dst.put_u16(request.command as u16);
        dst.put_u64(request.handle);
        dst.put_u64(request.offset);
        dst.put_u32(request.length);
        dst.put_slice(&request.data);
        Ok(())
    }
}

#[derive(Debug)]
struct PendingRead {
    length: u32,
    buf: BytesMut,
}

/// Decoder of simple replies.
///
/// A simple reply doesn't say how much data follows it, so every read in flight has to be
/// registered with [`ReplyCodec::expect_read`] before the request is sent. The payload is copied
/// into the buffer registered with it.
#[derive(Debug, Default)]
pub struct ReplyCodec {
    reads: HashMap<u64, PendingRead>,
}

impl ReplyCodec {
    pub fn expect_read(&mut self, handle: u64, length: u32, buf: BytesMut) {
        self.reads.insert(handle, PendingRead { length, buf });
    }
}

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < REPLY_HEADER_LEN {
            return Ok(None);
        }
        let mut header = &src[..REPLY_HEADER_LEN];
        let magic = header.get_u32();
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad reply magic {magic:#010x}"),
            ));
        }
        let error = header.get_u32();
        let handle = header.get_u64();
        let data_len = match self.reads.get(&handle) {
            Some(read) if error == 0 => read.length as usize,
            _ => 0,
        };
        if src.len() < REPLY_HEADER_LEN + data_len {
            src.reserve(REPLY_HEADER_LEN + data_len - src.len());
            return Ok(None);
        }
        src.advance(REPLY_HEADER_LEN);
        let data = match self.reads.remove(&handle) {
            Some(PendingRead { mut buf, .. }) if data_len > 0 => {
                buf.extend_from_slice(&src[..data_len]);
                src.advance(data_len);
                Some(buf.freeze())
            }
            _ => None,
        };
        Ok(Some(Reply {
            handle,
            error,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_header(error: u32, handle: u64) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(SIMPLE_REPLY_MAGIC);
        buf.put_u32(error);
        buf.put_u64(handle);
        buf
    }

    #[test]
    fn request_header_layout() {
        let mut buf = BytesMut::new();
        RequestCodec
            .encode(Request::write(7, 4096, Bytes::from_static(b"abcd")), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), REQUEST_HEADER_LEN + 4);
        assert_eq!(&buf[0..4], &REQUEST_MAGIC.to_be_bytes());
        assert_eq!(&buf[6..8], &1u16.to_be_bytes());
        assert_eq!(&buf[8..16], &7u64.to_be_bytes());
        assert_eq!(&buf[16..24], &4096u64.to_be_bytes());
        assert_eq!(&buf[24..28], &4u32.to_be_bytes());
        assert_eq!(&buf[28..], b"abcd");
    }

    #[test]
    fn read_reply_waits_for_its_payload() {
        let mut codec = ReplyCodec::default();
        let target = BytesMut::with_capacity(8);
        let target_ptr = target.as_ptr();
        codec.expect_read(3, 8, target);
        let mut buf = reply_header(0, 3);
        buf.put_slice(b"0123");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_slice(b"4567");
        let reply = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.handle, 3);
        assert_eq!(reply.data, Some(Bytes::from_static(b"01234567")));
        // the payload landed in the registered buffer
        assert_eq!(reply.data.unwrap().as_ptr(), target_ptr);
        assert!(buf.is_empty());
    }

    #[test]
    fn failed_read_carries_no_payload() {
        let mut codec = ReplyCodec::default();
        codec.expect_read(1, 512, BytesMut::with_capacity(512));
        codec.expect_read(2, 4, BytesMut::with_capacity(4));
        let mut buf = reply_header(EIO, 1);
        buf.extend_from_slice(&reply_header(0, 2));
        buf.put_slice(b"wxyz");
        let failed = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((failed.handle, failed.error, failed.data), (1, EIO, None));
        let ok = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ok.data, Some(Bytes::from_static(b"wxyz")));
    }

    #[test]
    fn bad_magic_is_invalid_data() {
        let mut codec = ReplyCodec::default();
        let mut buf = BytesMut::from(&[0u8; REPLY_HEADER_LEN][..]);
        let error = codec.decode(&mut buf).unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn fatal_errors() {
        for error in [EPERM, EINVAL, ENOSPC, ENOTSUP] {
            assert!(is_fatal_error(error), "{}", error_name(error));
        }
        for error in [EIO, ENOMEM, EOVERFLOW, ESHUTDOWN] {
            assert!(!is_fatal_error(error), "{}", error_name(error));
        }
    }
}

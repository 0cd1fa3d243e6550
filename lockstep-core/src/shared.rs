//! Shared frame state: host encode/decode closures and typed value serialization.
//!
//! The server calls [`SharedData::encode`] once per frame; the resulting block (header space
//! followed by the host's payload) is stamped and sent on every sync connection. Clients hand
//! each received payload to [`SharedData::decode`], which runs the host's decoder.
//!
//! Values are written with [`serialize`] and read back with [`deserialize`] in the same order on
//! both ends. Multi-byte values are little-endian; strings and vectors carry a `u32` length
//! prefix. There is no schema tagging: both ends must run the same encode/decode pair.

use std::sync::Mutex;

use tracing::warn;

use crate::protocol::{MessageKind, HEADER_SIZE};

const DEFAULT_BLOCK_SIZE: usize = 1024;

type EncodeFn = Box<dyn FnMut() -> Vec<u8> + Send>;
type DecodeFn = Box<dyn FnMut(&[u8]) + Send>;

/// Per-frame shared state block. Shared between the render thread (encode) and the
/// connection tasks (send on the server, decode on clients).
pub struct SharedData {
    block: Mutex<Vec<u8>>,
    encoder: Mutex<Option<EncodeFn>>,
    decoder: Mutex<Option<DecodeFn>>,
}

impl SharedData {
    pub fn new() -> Self {
        let mut block = Vec::with_capacity(DEFAULT_BLOCK_SIZE);
        block.extend_from_slice(&header_space());
        Self {
            block: Mutex::new(block),
            encoder: Mutex::new(None),
            decoder: Mutex::new(None),
        }
    }

    /// Set the closure producing this frame's payload (server side).
    pub fn set_encoder<F>(&self, f: F)
    where
        F: FnMut() -> Vec<u8> + Send + 'static,
    {
        *lock(&self.encoder) = Some(Box::new(f));
    }

    /// Set the closure consuming a received payload (client side).
    pub fn set_decoder<F>(&self, f: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        *lock(&self.decoder) = Some(Box::new(f));
    }

    /// Drop both host closures. Called on shutdown so no decode runs afterwards.
    pub fn clear_callbacks(&self) {
        *lock(&self.encoder) = None;
        *lock(&self.decoder) = None;
    }

    /// Rebuild the block: reserved header space, then the encoder's output.
    pub fn encode(&self) {
        // Run the host closure before taking the block lock; it may be slow.
        let payload = lock(&self.encoder).as_mut().map(|f| f());
        let mut block = lock(&self.block);
        block.clear();
        block.extend_from_slice(&header_space());
        if let Some(payload) = payload {
            block.extend_from_slice(&payload);
        }
    }

    /// Store a received payload in the block and hand it to the decoder.
    pub fn decode(&self, payload: &[u8]) {
        {
            let mut block = lock(&self.block);
            block.clear();
            block.extend_from_slice(payload);
        }
        match lock(&self.decoder).as_mut() {
            Some(f) => f(payload),
            None => warn!(len = payload.len(), "shared data received without a decoder"),
        }
    }

    /// Copy of the current block (header space included after `encode`).
    pub fn snapshot(&self) -> Vec<u8> {
        lock(&self.block).clone()
    }

    /// Run `f` with the block locked. Keep `f` short: no socket work under this lock.
    pub fn with_block<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&lock(&self.block))
    }

    /// Bytes currently in the block, header space included.
    pub fn data_size(&self) -> usize {
        lock(&self.block).len()
    }

    /// Bytes of host payload in an encoded block.
    pub fn user_data_size(&self) -> usize {
        self.data_size().saturating_sub(HEADER_SIZE)
    }

    /// Allocated capacity of the block.
    pub fn buffer_size(&self) -> usize {
        lock(&self.block).capacity()
    }
}

impl Default for SharedData {
    fn default() -> Self {
        Self::new()
    }
}

fn header_space() -> [u8; HEADER_SIZE] {
    let mut space = [MessageKind::Default.as_u8(); HEADER_SIZE];
    space[0] = MessageKind::Data.as_u8();
    space
}

// A panicking host closure must not wedge the transport.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A value with a fixed, explicit byte representation in shared data.
pub trait SharedValue: Sized {
    fn write_to(&self, buf: &mut Vec<u8>);
    fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError>;
}

/// Error reading a value back out of a shared data buffer.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of buffer at {pos}: need {need} bytes, {available} left")]
    UnexpectedEnd {
        pos: usize,
        need: usize,
        available: usize,
    },
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid char value {0:#x}")]
    InvalidChar(u32),
}

/// Append `value` to `buf`.
pub fn serialize<T: SharedValueRef + ?Sized>(buf: &mut Vec<u8>, value: &T) {
    value.write_ref(buf);
}

/// Read a `T` at `*pos` and advance the cursor past it.
pub fn deserialize<T: SharedValue>(buf: &[u8], pos: &mut usize) -> Result<T, CodecError> {
    T::read_from(buf, pos)
}

/// Serialization by reference, so unsized values like `str` and `[T]` can be written too.
pub trait SharedValueRef {
    fn write_ref(&self, buf: &mut Vec<u8>);
}

impl<T: SharedValue> SharedValueRef for T {
    fn write_ref(&self, buf: &mut Vec<u8>) {
        self.write_to(buf);
    }
}

impl SharedValueRef for str {
    fn write_ref(&self, buf: &mut Vec<u8>) {
        write_len(buf, self.len());
        buf.extend_from_slice(self.as_bytes());
    }
}

impl<T: SharedValue> SharedValueRef for [T] {
    fn write_ref(&self, buf: &mut Vec<u8>) {
        write_len(buf, self.len());
        for v in self {
            v.write_to(buf);
        }
    }
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], CodecError> {
    let available = buf.len().saturating_sub(*pos);
    if available < n {
        return Err(CodecError::UnexpectedEnd {
            pos: *pos,
            need: n,
            available,
        });
    }
    let out = &buf[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn read_len(buf: &[u8], pos: &mut usize) -> Result<usize, CodecError> {
    u32::read_from(buf, pos).map(|n| n as usize)
}

macro_rules! impl_shared_number {
    ($($t:ty),*) => {
        $(
            impl SharedValue for $t {
                fn write_to(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError> {
                    const N: usize = std::mem::size_of::<$t>();
                    let bytes = take(buf, pos, N)?;
                    let mut arr = [0u8; N];
                    arr.copy_from_slice(bytes);
                    Ok(<$t>::from_le_bytes(arr))
                }
            }
        )*
    };
}

impl_shared_number!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl SharedValue for bool {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(u8::from(*self));
    }

    fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError> {
        match take(buf, pos, 1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(CodecError::InvalidBool(b)),
        }
    }
}

impl SharedValue for char {
    fn write_to(&self, buf: &mut Vec<u8>) {
        u32::from(*self).write_to(buf);
    }

    fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError> {
        let v = u32::read_from(buf, pos)?;
        char::from_u32(v).ok_or(CodecError::InvalidChar(v))
    }
}

impl SharedValue for String {
    fn write_to(&self, buf: &mut Vec<u8>) {
        self.as_str().write_ref(buf);
    }

    fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError> {
        let len = read_len(buf, pos)?;
        let start = *pos;
        let bytes = take(buf, pos, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            *pos = start;
            CodecError::InvalidUtf8
        })
    }
}

impl<T: SharedValue> SharedValue for Vec<T> {
    fn write_to(&self, buf: &mut Vec<u8>) {
        self.as_slice().write_ref(buf);
    }

    fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError> {
        let len = read_len(buf, pos)?;
        // Don't trust the count for the allocation; each element is at least one byte.
        let mut out = Vec::with_capacity(len.min(buf.len().saturating_sub(*pos)));
        for _ in 0..len {
            out.push(T::read_from(buf, pos)?);
        }
        Ok(out)
    }
}

impl<T: SharedValue, const N: usize> SharedValue for [T; N] {
    fn write_to(&self, buf: &mut Vec<u8>) {
        for v in self {
            v.write_to(buf);
        }
    }

    fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError> {
        let mut out = Vec::with_capacity(N);
        for _ in 0..N {
            out.push(T::read_from(buf, pos)?);
        }
        match out.try_into() {
            Ok(arr) => Ok(arr),
            Err(_) => unreachable!("exactly N elements were read"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    fn roundtrip<T: SharedValue + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        serialize(&mut buf, &value);
        let mut pos = 0;
        let back: T = deserialize(&buf, &mut pos).unwrap();
        assert_eq!(back, value);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn primitives_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            roundtrip(rng.gen::<u8>());
            roundtrip(rng.gen::<u16>());
            roundtrip(rng.gen::<u32>());
            roundtrip(rng.gen::<u64>());
            roundtrip(rng.gen::<i8>());
            roundtrip(rng.gen::<i16>());
            roundtrip(rng.gen::<i32>());
            roundtrip(rng.gen::<i64>());
            roundtrip(rng.gen::<f32>());
            roundtrip(rng.gen::<f64>());
            roundtrip(rng.gen::<bool>());
            roundtrip(rng.gen::<char>());
        }
        roundtrip(f64::MAX);
        roundtrip(i64::MIN);
    }

    #[test]
    fn strings_and_vectors_roundtrip() {
        roundtrip(String::new());
        roundtrip(String::from("frame lock ✓"));
        roundtrip(Vec::<f32>::new());
        roundtrip(vec![1.5f32, -2.0, 3.25]);
        roundtrip(vec![String::from("a"), String::new(), String::from("ccc")]);
        roundtrip(vec![vec![1u16, 2], vec![], vec![3]]);
        roundtrip([0.5f64, 1.0, 2.0, 4.0]);
    }

    #[test]
    fn string_layout_is_length_prefixed() {
        let mut buf = Vec::new();
        serialize(&mut buf, "abc");
        assert_eq!(buf, [3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn vector_layout_is_count_prefixed() {
        let mut buf = Vec::new();
        serialize(&mut buf, &vec![1u16, 2u16][..]);
        assert_eq!(buf, [2, 0, 0, 0, 1, 0, 2, 0]);
    }

    #[test]
    fn double_and_bool_are_nine_bytes() {
        let mut buf = Vec::new();
        serialize(&mut buf, &12.5f64);
        serialize(&mut buf, &true);
        assert_eq!(buf.len(), 9);
        let mut pos = 0;
        assert_eq!(deserialize::<f64>(&buf, &mut pos).unwrap(), 12.5);
        assert!(deserialize::<bool>(&buf, &mut pos).unwrap());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut buf = Vec::new();
        serialize(&mut buf, &vec![1u32, 2, 3]);
        buf.truncate(buf.len() - 1);
        let mut pos = 0;
        assert!(matches!(
            deserialize::<Vec<u32>>(&buf, &mut pos),
            Err(CodecError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn bad_values_rejected() {
        let mut pos = 0;
        assert_eq!(
            deserialize::<bool>(&[2], &mut pos),
            Err(CodecError::InvalidBool(2))
        );
        let mut pos = 0;
        assert_eq!(
            deserialize::<String>(&[2, 0, 0, 0, 0xff, 0xfe], &mut pos),
            Err(CodecError::InvalidUtf8)
        );
    }

    #[test]
    fn encode_reserves_header_space() {
        let shared = SharedData::new();
        shared.set_encoder(|| {
            let mut buf = Vec::new();
            serialize(&mut buf, &12.5f64);
            serialize(&mut buf, &true);
            buf
        });
        shared.encode();
        assert_eq!(shared.data_size(), HEADER_SIZE + 9);
        assert_eq!(shared.user_data_size(), 9);
        let block = shared.snapshot();
        assert_eq!(block[0], MessageKind::Data.as_u8());

        // Encoding again replaces, never appends.
        shared.encode();
        assert_eq!(shared.data_size(), HEADER_SIZE + 9);
    }

    #[test]
    fn encode_without_encoder_is_header_only() {
        let shared = SharedData::new();
        shared.encode();
        assert_eq!(shared.data_size(), HEADER_SIZE);
        assert!(shared.buffer_size() >= DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn decode_runs_decoder() {
        let shared = SharedData::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        shared.set_decoder(move |bytes| sink.lock().unwrap().extend_from_slice(bytes));
        shared.decode(b"hello");
        assert_eq!(&*seen.lock().unwrap(), b"hello");
        assert_eq!(shared.snapshot(), b"hello");

        shared.clear_callbacks();
        shared.decode(b"again");
        assert_eq!(&*seen.lock().unwrap(), b"hello");
    }
}

use bytes::{BufMut, BytesMut};
use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
};

#[cfg(debug_assertions)]
use log::debug;

use super::buffer_pool::BufferPool;
use crate::{data_types::MessageLength, packet::Packet};

pub const MESSAGE_LENGTH_SIZE: usize = size_of::<MessageLength>();
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Writes the length prefix followed by the payload. Returns the payload size.
pub fn write_frame(stream: &mut impl Write, packet: &Packet) -> io::Result<usize> {
    let frame = packet.with_payload(|payload| {
        let length: MessageLength = payload.len().try_into().map_err(|_| {
            io::Error::new(ErrorKind::InvalidInput, "Packet length does not fit the length prefix")
        })?;
        let mut frame = BytesMut::with_capacity(MESSAGE_LENGTH_SIZE + payload.len());
        frame.put_u32_le(length);
        frame.put_slice(payload);
        Ok::<_, io::Error>(frame)
    })?;

    #[cfg(debug_assertions)]
    debug!("Framing: Sending {} byte frame", frame.len());

    stream.write_all(&frame)?;
    stream.flush()?;
    Ok(frame.len() - MESSAGE_LENGTH_SIZE)
}

/// Blocks until one whole frame has been read. A peer that closes the stream
/// cleanly between frames produces `UnexpectedEof`.
pub fn read_frame(stream: &mut impl Read, buffer_pool: &Arc<BufferPool>) -> io::Result<Packet> {
    let mut length_bytes = [0u8; MESSAGE_LENGTH_SIZE];
    stream.read_exact(&mut length_bytes)?;
    let length = MessageLength::from_le_bytes(length_bytes) as usize;

    if length > MAX_PACKET_SIZE {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("Frame of {length} bytes exceeds the maximum packet size"),
        ));
    }

    #[cfg(debug_assertions)]
    debug!("Framing: Next frame is {length} bytes");

    let packet = Packet::from_pool(buffer_pool, length);
    packet.with_payload_mut(|payload| stream.read_exact(payload))?;
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(payload: &[u8]) -> Packet {
        let pool = Arc::new(BufferPool::new());
        let mut wire = Vec::new();
        let written = write_frame(&mut wire, &Packet::from_slice(payload)).unwrap();
        assert_eq!(written, payload.len());
        assert_eq!(wire.len(), MESSAGE_LENGTH_SIZE + payload.len());
        read_frame(&mut Cursor::new(wire), &pool).unwrap()
    }

    #[test]
    fn should_prefix_payload_with_little_endian_length() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Packet::from("PING")).unwrap();
        assert_eq!(wire, [4, 0, 0, 0, b'P', b'I', b'N', b'G']);
    }

    #[test]
    fn should_round_trip_boundary_sizes() {
        for size in [0usize, 1, 4, 64 * 1024] {
            let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let packet = round_trip(&payload);
            assert_eq!(packet.size(), size);
            assert_eq!(packet.to_vec(), payload);
        }
    }

    #[test]
    fn should_read_consecutive_frames_in_order() {
        let pool = Arc::new(BufferPool::new());
        let mut wire = Vec::new();
        write_frame(&mut wire, &Packet::from("one")).unwrap();
        write_frame(&mut wire, &Packet::from("two")).unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor, &pool).unwrap().to_vec(), b"one");
        assert_eq!(read_frame(&mut cursor, &pool).unwrap().to_vec(), b"two");
        let err = read_frame(&mut cursor, &pool).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn should_reject_oversized_prefix() {
        let pool = Arc::new(BufferPool::new());
        let wire = ((MAX_PACKET_SIZE + 1) as MessageLength).to_le_bytes().to_vec();
        let err = read_frame(&mut Cursor::new(wire), &pool).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn should_fail_on_truncated_payload() {
        let pool = Arc::new(BufferPool::new());
        let mut wire = 10u32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"short");
        let err = read_frame(&mut Cursor::new(wire), &pool).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}

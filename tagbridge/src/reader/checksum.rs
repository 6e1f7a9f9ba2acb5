//! Frame checksum for the reader's serial protocol.
//!
//! The reader closes every frame with a single byte XOR'd over all preceding
//! frame bytes, start byte included. A frame is valid when XOR over the whole
//! frame (checksum included) comes out zero.

/// XOR checksum over a slice of bytes.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Validates a complete frame, trailing checksum byte included.
pub fn checksum_is_valid(frame: &[u8]) -> bool {
    checksum(frame) == 0
}

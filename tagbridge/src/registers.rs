//! Holding-register map and backing store.
//!
//! Addresses, access kinds and mode gates live here as data; the controller
//! in [`crate::fb`] interprets them. The store itself is dumb: it holds 16-bit
//! words per region and converts between words and reader byte streams.
//!
//! # Byte packing
//!
//! Data regions (keys, block window, UID, tunnel) pack low-byte-first: byte N
//! lands in the low byte of a register, byte N+1 in its high byte. The ASCII
//! version region packs high-byte-first so the string reads naturally in a
//! register dump. The asymmetry is deliberate and matched by field clients.

use strum::FromRepr;

use crate::reader::{KeySelect, TagReport};

/// Function block selector, register 1009.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Mode {
    #[default]
    Standby = 0,
    Uid = 1,
    Mifare = 2,
    Tunnel = 3,
}

impl Mode {
    /// Whether the reader runs continuous UID polling in this mode.
    pub fn polls(self) -> bool {
        !matches!(self, Mode::Standby)
    }
}

/// Block selector word, register 1016. Low byte picks the MIFARE block,
/// high-byte bit 0 picks the key slot. High-byte bits 1 to 7 are reserved
/// and must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSelect {
    pub block: u8,
    pub key: KeySelect,
}

impl TryFrom<u16> for BlockSelect {
    type Error = u16;

    fn try_from(word: u16) -> Result<Self, u16> {
        if word & 0xfe00 != 0 {
            return Err(word);
        }
        Ok(BlockSelect {
            block: (word & 0x00ff) as u8,
            key: if word & 0x0100 != 0 {
                KeySelect::B
            } else {
                KeySelect::A
            },
        })
    }
}

/// One contiguous run of registers with uniform access rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Mode,
    KeyA,
    KeyB,
    BlockSelect,
    BlockData,
    LastOutcome,
    Led,
    TagInfo,
    Version,
    TunnelRx,
    TunnelTx,
}

impl Region {
    pub const ALL: [Region; 11] = [
        Region::Mode,
        Region::KeyA,
        Region::KeyB,
        Region::BlockSelect,
        Region::BlockData,
        Region::LastOutcome,
        Region::Led,
        Region::TagInfo,
        Region::Version,
        Region::TunnelRx,
        Region::TunnelTx,
    ];

    pub const fn base(self) -> u16 {
        match self {
            Region::Mode => 1009,
            Region::KeyA => 1010,
            Region::KeyB => 1013,
            Region::BlockSelect => 1016,
            Region::BlockData => 1018,
            Region::LastOutcome => 1026,
            Region::Led => 1027,
            Region::TagInfo => 2010,
            Region::Version => 2030,
            Region::TunnelRx => 2100,
            Region::TunnelTx => 2200,
        }
    }

    pub const fn len(self) -> u16 {
        match self {
            Region::Mode | Region::BlockSelect | Region::LastOutcome => 1,
            Region::Led => 2,
            Region::KeyA | Region::KeyB => 3,
            Region::BlockData | Region::TagInfo => 8,
            Region::Version => 17,
            Region::TunnelRx | Region::TunnelTx => 21,
        }
    }

    pub fn readable(self) -> bool {
        !matches!(self, Region::Led | Region::TunnelTx)
    }

    pub fn writable(self) -> bool {
        !matches!(
            self,
            Region::LastOutcome | Region::TagInfo | Region::Version | Region::TunnelRx
        )
    }

    /// The mode that must be active before this region may be touched.
    pub fn mode_gate(self) -> Option<Mode> {
        match self {
            Region::KeyA
            | Region::KeyB
            | Region::BlockSelect
            | Region::BlockData
            | Region::Led => Some(Mode::Mifare),
            Region::TunnelRx | Region::TunnelTx => Some(Mode::Tunnel),
            _ => None,
        }
    }

    /// Find the region wholly containing `[addr, addr + count)`, along with
    /// the word offset of `addr` inside it. Ranges that straddle a region
    /// boundary or touch unmapped addresses find nothing.
    pub fn locate(addr: u16, count: u16) -> Option<(Region, usize)> {
        if count == 0 {
            return None;
        }
        for region in Region::ALL {
            let base = region.base();
            let end = base + region.len();
            if addr >= base && addr.checked_add(count)? <= end {
                return Some((region, (addr - base) as usize));
            }
        }
        None
    }
}

/// Pack a byte stream into words, low byte first. Trailing odd byte lands in
/// the low byte of a final word with a zero high byte.
pub fn pack_bytes(bytes: &[u8], words: &mut [u16]) {
    for (i, word) in words.iter_mut().enumerate() {
        let lo = bytes.get(2 * i).copied().unwrap_or(0);
        let hi = bytes.get(2 * i + 1).copied().unwrap_or(0);
        *word = u16::from(hi) << 8 | u16::from(lo);
    }
}

/// Inverse of [`pack_bytes`].
pub fn unpack_bytes(words: &[u16], bytes: &mut [u8]) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        let word = words.get(i / 2).copied().unwrap_or(0);
        *byte = if i % 2 == 0 { word as u8 } else { (word >> 8) as u8 };
    }
}

/// Pack ASCII bytes into words, high byte first (readable in register dumps).
pub fn pack_ascii(bytes: &[u8], words: &mut [u16]) {
    for (i, word) in words.iter_mut().enumerate() {
        let hi = bytes.get(2 * i).copied().unwrap_or(0);
        let lo = bytes.get(2 * i + 1).copied().unwrap_or(0);
        *word = u16::from(hi) << 8 | u16::from(lo);
    }
}

/// Outcome word for register 1026: reader exception in the high byte, the
/// command it answered in the low byte.
pub fn outcome(exception: u8, command: u8) -> u16 {
    u16::from(exception) << 8 | u16::from(command)
}

/// Outcome for a completed transaction.
pub const OUTCOME_OK: u16 = 0x0000;
/// Outcome for a timeout or other failure internal to the bridge (command 0).
pub const OUTCOME_INTERNAL: u16 = 0x0100;

/// Backing store for every mapped register.
#[derive(Debug, Default)]
pub struct RegisterFile {
    mode_word: u16,
    key_a: [u16; 3],
    key_b: [u16; 3],
    block_select: u16,
    block_data: [u16; 8],
    last_outcome: u16,
    led: [u16; 2],
    tag_info: [u16; 8],
    version: [u16; 17],
    tunnel_rx: [u16; 21],
    tunnel_tx: [u16; 21],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> Mode {
        // Only set_mode writes the word, so it always holds a valid repr.
        Mode::from_repr(self.mode_word).unwrap_or_default()
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode_word = mode as u16;
    }

    /// Raw words of a region, for buffer reads.
    pub fn words(&self, region: Region) -> &[u16] {
        match region {
            Region::Mode => std::slice::from_ref(&self.mode_word),
            Region::KeyA => &self.key_a,
            Region::KeyB => &self.key_b,
            Region::BlockSelect => std::slice::from_ref(&self.block_select),
            Region::BlockData => &self.block_data,
            Region::LastOutcome => std::slice::from_ref(&self.last_outcome),
            Region::Led => &self.led,
            Region::TagInfo => &self.tag_info,
            Region::Version => &self.version,
            Region::TunnelRx => &self.tunnel_rx,
            Region::TunnelTx => &self.tunnel_tx,
        }
    }

    /// Mutable words of a region, for buffer writes. The mode register is
    /// not included here; mode changes go through the controller.
    pub fn words_mut(&mut self, region: Region) -> Option<&mut [u16]> {
        match region {
            Region::KeyA => Some(&mut self.key_a),
            Region::KeyB => Some(&mut self.key_b),
            Region::BlockSelect => Some(std::slice::from_mut(&mut self.block_select)),
            Region::BlockData => Some(&mut self.block_data),
            Region::Led => Some(&mut self.led),
            Region::TunnelTx => Some(&mut self.tunnel_tx),
            _ => None,
        }
    }

    pub fn block_select(&self) -> u16 {
        self.block_select
    }

    /// The 6 key bytes currently buffered for a slot.
    pub fn key_bytes(&self, key: KeySelect) -> [u8; 6] {
        let words = match key {
            KeySelect::A => &self.key_a,
            KeySelect::B => &self.key_b,
        };
        let mut bytes = [0u8; 6];
        unpack_bytes(words, &mut bytes);
        bytes
    }

    pub fn block_data_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        unpack_bytes(&self.block_data, &mut bytes);
        bytes
    }

    pub fn set_block_data_bytes(&mut self, bytes: &[u8; 16]) {
        pack_bytes(bytes, &mut self.block_data);
    }

    pub fn last_outcome(&self) -> u16 {
        self.last_outcome
    }

    pub fn set_outcome(&mut self, outcome: u16) {
        self.last_outcome = outcome;
    }

    /// Publish a tag report into 2010 to 2017:
    /// `[uid_len, uid words.., atqa, sak]`.
    pub fn set_tag_report(&mut self, report: &TagReport) {
        self.tag_info[0] = u16::from(report.uid_len);
        pack_bytes(&report.uid, &mut self.tag_info[1..6]);
        self.tag_info[6] = report.atqa;
        self.tag_info[7] = u16::from(report.sak);
    }

    pub fn clear_tag_info(&mut self) {
        self.tag_info = [0; 8];
    }

    /// Cache the reader's version string into 2030 to 2046, truncated to fit.
    pub fn set_version(&mut self, ascii: &[u8]) {
        let take = ascii.len().min(2 * self.version.len());
        pack_ascii(&ascii[..take], &mut self.version);
    }

    /// Publish a tunnel response: length-prefixed raw bytes into 2100+.
    /// Oversized frames are truncated to the region's capacity.
    pub fn set_tunnel_rx(&mut self, raw: &[u8]) {
        let capacity = 2 * (self.tunnel_rx.len() - 1);
        let take = raw.len().min(capacity);
        self.tunnel_rx[0] = take as u16;
        pack_bytes(&raw[..take], &mut self.tunnel_rx[1..]);
    }

    /// The buffered tunnel TX payload: word 0 is the byte count.
    pub fn tunnel_tx_bytes(&self) -> Option<Vec<u8>> {
        let len = self.tunnel_tx[0] as usize;
        if len > 2 * (self.tunnel_tx.len() - 1) {
            return None;
        }
        let mut bytes = vec![0u8; len];
        unpack_bytes(&self.tunnel_tx[1..], &mut bytes);
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1009, 1, Some((Region::Mode, 0)); "mode")]
    #[test_case(1010, 3, Some((Region::KeyA, 0)); "full key a")]
    #[test_case(1014, 1, Some((Region::KeyB, 1)); "key b middle word")]
    #[test_case(1018, 8, Some((Region::BlockData, 0)); "full block window")]
    #[test_case(1020, 2, Some((Region::BlockData, 2)); "partial block window")]
    #[test_case(1027, 2, Some((Region::Led, 0)); "led pair")]
    #[test_case(2200, 9, Some((Region::TunnelTx, 0)); "tunnel tx")]
    #[test_case(1017, 1, None; "unmapped gap")]
    #[test_case(1025, 2, None; "straddles block data and outcome")]
    #[test_case(1009, 0, None; "zero count")]
    #[test_case(5000, 4, None; "far outside the map")]
    fn locate(addr: u16, count: u16, expect: Option<(Region, usize)>) {
        assert_eq!(Region::locate(addr, count), expect);
    }

    #[test]
    fn packing_is_low_byte_first_for_data() {
        let mut words = [0u16; 3];
        pack_bytes(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06], &mut words);
        assert_eq!(words, [0x0201, 0x0403, 0x0605]);

        let mut bytes = [0u8; 6];
        unpack_bytes(&words, &mut bytes);
        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn packing_is_high_byte_first_for_ascii() {
        let mut words = [0u16; 2];
        pack_ascii(b"RF10", &mut words);
        assert_eq!(words, [0x5246, 0x3130]);
    }

    #[test_case(0x0004, Some((0x04, KeySelect::A)); "block 4 key a")]
    #[test_case(0x0104, Some((0x04, KeySelect::B)); "block 4 key b")]
    #[test_case(0x00ff, Some((0xff, KeySelect::A)); "top block")]
    #[test_case(0x0204, None; "reserved bit set")]
    #[test_case(0x8000, None; "high reserved bit set")]
    fn block_select_parse(word: u16, expect: Option<(u8, KeySelect)>) {
        let parsed = BlockSelect::try_from(word).ok();
        assert_eq!(parsed.map(|s| (s.block, s.key)), expect);
    }

    #[test]
    fn key_buffer_round_trip() {
        let mut file = RegisterFile::new();
        let words = file.words_mut(Region::KeyB).unwrap();
        pack_bytes(&[0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5], words);
        assert_eq!(file.key_bytes(KeySelect::B), [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5]);
        assert_eq!(file.key_bytes(KeySelect::A), [0; 6]);
    }

    #[test]
    fn tag_report_region_layout() {
        let mut file = RegisterFile::new();
        let mut uid = [0u8; TagReport::MAX_UID_LEN];
        uid[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        file.set_tag_report(&TagReport {
            uid,
            uid_len: 4,
            atqa: 0x0004,
            sak: 0x08,
        });

        let words = file.words(Region::TagInfo);
        assert_eq!(words[0], 4);
        assert_eq!(words[1], 0xadde);
        assert_eq!(words[2], 0xefbe);
        assert_eq!(words[6], 0x0004);
        assert_eq!(words[7], 0x0008);

        file.clear_tag_info();
        assert_eq!(file.words(Region::TagInfo), &[0u16; 8]);
    }

    #[test]
    fn tunnel_rx_is_length_prefixed() {
        let mut file = RegisterFile::new();
        file.set_tunnel_rx(&[0x50, 0x00, 0x00, 0x04, 0x54]);
        let words = file.words(Region::TunnelRx);
        assert_eq!(words[0], 5);
        assert_eq!(words[1], 0x0050);
        assert_eq!(words[2], 0x0400);
        assert_eq!(words[3], 0x0054);
    }

    #[test]
    fn tunnel_tx_length_is_validated() {
        let mut file = RegisterFile::new();
        let words = file.words_mut(Region::TunnelTx).unwrap();
        words[0] = 3;
        words[1] = 0x0050;
        words[2] = 0x0000;
        assert_eq!(file.tunnel_tx_bytes(), Some(vec![0x50, 0x00, 0x00]));

        let words = file.words_mut(Region::TunnelTx).unwrap();
        words[0] = 41; // exceeds the 40-byte payload capacity
        assert_eq!(file.tunnel_tx_bytes(), None);
    }
}

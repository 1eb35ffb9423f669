use std::fmt;
use std::str::FromStr;

/// 48-bit Bluetooth device address, stored most-significant byte first
/// (display order). Ordering and equality compare the address as a single
/// integer, so it can key a `BTreeMap`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BdAddr(pub [u8; 6]);

/// Whitelist sentinel: a single FF:FF:FF:FF:FF:FF entry means "every device
/// already known to the aggregator".
pub const ADDR_ALL: BdAddr = BdAddr([0xFF; 6]);

impl BdAddr {
    /// Random static addresses have the two most significant bits set.
    pub fn is_random_static(&self) -> bool {
        self.0[0] >> 6 == 0b11
    }

    /// Twelve uppercase hex digits, no separators. Used in log, cache and
    /// SVG file names.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(12);
        for b in self.0 {
            out.push_str(&format!("{b:02X}"));
        }
        out
    }

    /// Little-endian byte order as it appears on the HCI wire.
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut le = self.0;
        le.reverse();
        le
    }

    pub fn from_le_bytes(le: [u8; 6]) -> Self {
        let mut be = le;
        be.reverse();
        BdAddr(be)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddrError(String);

impl fmt::Display for ParseAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bluetooth address: {}", self.0)
    }
}

impl std::error::Error for ParseAddrError {}

impl FromStr for BdAddr {
    type Err = ParseAddrError;

    /// Accepts `AA:BB:CC:DD:EE:FF` and `AABBCCDDEEFF`, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != ':').collect();
        if compact.len() != 12 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseAddrError(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, chunk) in compact.as_bytes().chunks(2).enumerate() {
            let text = std::str::from_utf8(chunk).map_err(|_| ParseAddrError(s.to_string()))?;
            bytes[i] = u8::from_str_radix(text, 16).map_err(|_| ParseAddrError(s.to_string()))?;
        }
        Ok(BdAddr(bytes))
    }
}

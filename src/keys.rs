//! Bidirectional mapping between key names and keyboard scan codes.
//!
//! The table holds HID usage codes. The keyboard reports its modifier keys
//! `0x10` above their HID usage, so codes in the modifier band are shifted on
//! the way in and out of the table.

use std::collections::HashMap;
use std::sync::OnceLock;

/// First table code of the modifier band.
pub const MODIFIER_FIRST: u8 = 0xE0;
/// One past the last table code of the modifier band.
pub const MODIFIER_END: u8 = 0xE8;
/// Distance between a modifier's table code and its device code.
pub const MODIFIER_OFFSET: u8 = 0x10;

const KEY_NAMES: &[(u8, &str)] = &[
    (0x00, "NONE"),
    (0x04, "A"),
    (0x05, "B"),
    (0x06, "C"),
    (0x07, "D"),
    (0x08, "E"),
    (0x09, "F"),
    (0x0A, "G"),
    (0x0B, "H"),
    (0x0C, "I"),
    (0x0D, "J"),
    (0x0E, "K"),
    (0x0F, "L"),
    (0x10, "M"),
    (0x11, "N"),
    (0x12, "O"),
    (0x13, "P"),
    (0x14, "Q"),
    (0x15, "R"),
    (0x16, "S"),
    (0x17, "T"),
    (0x18, "U"),
    (0x19, "V"),
    (0x1A, "W"),
    (0x1B, "X"),
    (0x1C, "Y"),
    (0x1D, "Z"),
    (0x1E, "1"),
    (0x1F, "2"),
    (0x20, "3"),
    (0x21, "4"),
    (0x22, "5"),
    (0x23, "6"),
    (0x24, "7"),
    (0x25, "8"),
    (0x26, "9"),
    (0x27, "0"),
    (0x28, "ENTER"),
    (0x29, "ESC"),
    (0x2A, "BACKSPACE"),
    (0x2B, "TAB"),
    (0x2C, "SPACE"),
    (0x2D, "MINUS"),
    (0x2E, "EQUAL"),
    (0x2F, "LEFTBRACE"),
    (0x30, "RIGHTBRACE"),
    (0x31, "BACKSLASH"),
    (0x32, "HASHTILDE"),
    (0x33, "SEMICOLON"),
    (0x34, "APOSTROPHE"),
    (0x35, "GRAVE"),
    (0x36, "COMMA"),
    (0x37, "DOT"),
    (0x38, "SLASH"),
    (0x39, "CAPSLOCK"),
    (0x3A, "F1"),
    (0x3B, "F2"),
    (0x3C, "F3"),
    (0x3D, "F4"),
    (0x3E, "F5"),
    (0x3F, "F6"),
    (0x40, "F7"),
    (0x41, "F8"),
    (0x42, "F9"),
    (0x43, "F10"),
    (0x44, "F11"),
    (0x45, "F12"),
    (0x46, "PRINTSCREEN"),
    (0x47, "SCROLLLOCK"),
    (0x48, "PAUSE"),
    (0x49, "INSERT"),
    (0x4A, "HOME"),
    (0x4B, "PAGEUP"),
    (0x4C, "DELETE"),
    (0x4D, "END"),
    (0x4E, "PAGEDOWN"),
    (0x4F, "RIGHT"),
    (0x50, "LEFT"),
    (0x51, "DOWN"),
    (0x52, "UP"),
    (0x53, "NUMLOCK"),
    (0x54, "KPSLASH"),
    (0x55, "KPASTERISK"),
    (0x56, "KPMINUS"),
    (0x57, "KPPLUS"),
    (0x58, "KPENTER"),
    (0x59, "KP1"),
    (0x5A, "KP2"),
    (0x5B, "KP3"),
    (0x5C, "KP4"),
    (0x5D, "KP5"),
    (0x5E, "KP6"),
    (0x5F, "KP7"),
    (0x60, "KP8"),
    (0x61, "KP9"),
    (0x62, "KP0"),
    (0x63, "KPDOT"),
    (0x64, "102ND"),
    (0x65, "COMPOSE"),
    (0x66, "POWER"),
    (0x67, "KPEQUAL"),
    (0x68, "F13"),
    (0x69, "F14"),
    (0x6A, "F15"),
    (0x6B, "F16"),
    (0x6C, "F17"),
    (0x6D, "F18"),
    (0x6E, "F19"),
    (0x6F, "F20"),
    (0x70, "F21"),
    (0x71, "F22"),
    (0x72, "F23"),
    (0x73, "F24"),
    (0x7F, "MUTE"),
    (0x80, "VOLUMEUP"),
    (0x81, "VOLUMEDOWN"),
    (0xE0, "LEFTCTRL"),
    (0xE1, "LEFTSHIFT"),
    (0xE2, "LEFTALT"),
    (0xE3, "LEFTMETA"),
    (0xE4, "RIGHTCTRL"),
    (0xE5, "RIGHTSHIFT"),
    (0xE6, "RIGHTALT"),
    (0xE7, "RIGHTMETA"),
];

/// Lookup table between key names and scan codes. Immutable once built.
#[derive(Debug, Clone)]
pub struct KeyTable {
    names: HashMap<u8, &'static str>,
    codes: HashMap<&'static str, u8>,
    max_name_len: usize,
}

impl KeyTable {
    fn new(entries: &[(u8, &'static str)]) -> Self {
        let names = entries.iter().copied().collect::<HashMap<_, _>>();
        let codes = entries.iter().map(|&(code, name)| (name, code)).collect();
        let max_name_len = entries.iter().map(|(_, name)| name.len()).max().unwrap_or(0);

        KeyTable {
            names,
            codes,
            max_name_len,
        }
    }

    /// The table of standard keyboard key names.
    pub fn standard() -> &'static KeyTable {
        static TABLE: OnceLock<KeyTable> = OnceLock::new();
        TABLE.get_or_init(|| KeyTable::new(KEY_NAMES))
    }

    /// Name of the key the device reports as `scan_code`.
    pub fn name_for(&self, scan_code: u8) -> Option<&'static str> {
        let table_code = if scan_code >= MODIFIER_FIRST {
            scan_code - MODIFIER_OFFSET
        } else {
            scan_code
        };
        self.names.get(&table_code).copied()
    }

    /// Device scan code of the key called `name` (exact, upper-case match).
    pub fn code_for(&self, name: &str) -> Option<u8> {
        self.table_code(name).map(|code| {
            if (MODIFIER_FIRST..MODIFIER_END).contains(&code) {
                code + MODIFIER_OFFSET
            } else {
                code
            }
        })
    }

    /// Raw table entry for `name`, without the modifier adjustment.
    pub fn table_code(&self, name: &str) -> Option<u8> {
        self.codes.get(name).copied()
    }

    /// Resolve a patch token: a key name in any case, or failing that a raw
    /// hex scan code which is used unadjusted.
    pub fn resolve_token(&self, token: &str) -> Option<u8> {
        let upper = token.to_ascii_uppercase();
        self.code_for(&upper).or_else(|| {
            upper
                .bytes()
                .all(|b| b.is_ascii_hexdigit())
                .then(|| u8::from_str_radix(&upper, 16).ok())
                .flatten()
        })
    }

    /// Length of the longest key name, for column alignment.
    pub fn max_name_len(&self) -> usize {
        self.max_name_len
    }

    /// Whether the device code belongs to the shifted modifier page.
    pub fn is_extended(scan_code: u8) -> bool {
        scan_code >= MODIFIER_FIRST
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only flattened-device-tree (DTB) parsing.
//!
//! The kernel consumes a standard DTB blob at boot to learn the tick clock
//! frequency and the console identity; everything else in the tree belongs
//! to drivers. This parser is accordingly minimal: validate the header, find
//! a node by path, read its properties. All numbers in a DTB are big-endian,
//! which is `byteorder`'s problem, not ours.
//!
//! No allocation, no mutation; parsing borrows the blob.

use byteorder::{BigEndian, ByteOrder};

pub const FDT_MAGIC: u32 = 0xD00D_FEED;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Byte offset of a node's first token after its name. Opaque handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Node(usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FdtError {
    /// Too short, wrong magic, or internally inconsistent offsets.
    BadHeader,
    /// Structure block contains an unknown token or runs off the end.
    BadStructure,
}

pub struct Fdt<'a> {
    data: &'a [u8],
    struct_off: usize,
    struct_end: usize,
    strings_off: usize,
}

impl<'a> Fdt<'a> {
    /// Validates the DTB header and wraps the blob for navigation.
    pub fn new(data: &'a [u8]) -> Result<Self, FdtError> {
        if data.len() < 40 {
            return Err(FdtError::BadHeader);
        }
        let magic = BigEndian::read_u32(&data[0..]);
        let total_size = BigEndian::read_u32(&data[4..]) as usize;
        let struct_off = BigEndian::read_u32(&data[8..]) as usize;
        let strings_off = BigEndian::read_u32(&data[12..]) as usize;
        let struct_size = BigEndian::read_u32(&data[36..]) as usize;

        if magic != FDT_MAGIC
            || total_size > data.len()
            || struct_off >= total_size
            || strings_off >= total_size
            || struct_off + struct_size > total_size
        {
            return Err(FdtError::BadHeader);
        }
        Ok(Self {
            data,
            struct_off,
            struct_end: struct_off + struct_size,
            strings_off,
        })
    }

    fn token_at(&self, off: usize) -> Option<u32> {
        if off + 4 > self.struct_end {
            return None;
        }
        Some(BigEndian::read_u32(&self.data[off..]))
    }

    /// NUL-terminated string starting at `off`, within `self.data`.
    fn cstr_at(&self, off: usize) -> Option<&'a str> {
        let rest = self.data.get(off..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        core::str::from_utf8(&rest[..nul]).ok()
    }

    /// Finds a node by absolute path, e.g. `"/console"` or `"/"`.
    pub fn find_node(&self, path: &str) -> Option<Node> {
        let want = path.split('/').filter(|c| !c.is_empty()).count();
        let component = |i: usize| {
            path.split('/').filter(|c| !c.is_empty()).nth(i)
        };

        let mut off = self.struct_off;
        let mut depth = 0usize; // BEGIN_NODEs entered minus END_NODEs left
        let mut matched = 0usize; // leading path components matched

        loop {
            match self.token_at(off)? {
                FDT_BEGIN_NODE => {
                    let name = self.cstr_at(off + 4)?;
                    let after = align4(off + 4 + name.len() + 1);
                    depth += 1;
                    if depth == 1 {
                        // Root node; its name is empty.
                        if want == 0 {
                            return Some(Node(after));
                        }
                    } else if depth - 2 == matched
                        && component(matched) == Some(name)
                    {
                        matched += 1;
                        if matched == want {
                            return Some(Node(after));
                        }
                    }
                    off = after;
                }
                FDT_END_NODE => {
                    depth = depth.checked_sub(1)?;
                    // A matched component at index i is open only while
                    // depth >= i + 2; leaving its node retires it.
                    matched = matched.min(depth.saturating_sub(1));
                    off += 4;
                }
                FDT_PROP => {
                    let len = self.token_at(off + 4)? as usize;
                    off = align4(off + 12 + len);
                }
                FDT_NOP => off += 4,
                FDT_END => return None,
                _ => return None,
            }
        }
    }

    /// Raw bytes of a property of `node`, or `None` if absent. Properties
    /// precede child nodes in the structure block, so the scan stops at the
    /// first BEGIN_NODE/END_NODE.
    pub fn property(&self, node: Node, name: &str) -> Option<&'a [u8]> {
        let mut off = node.0;
        loop {
            match self.token_at(off)? {
                FDT_PROP => {
                    let len = self.token_at(off + 4)? as usize;
                    let name_off = self.token_at(off + 8)? as usize;
                    let data_off = off + 12;
                    if self.cstr_at(self.strings_off + name_off)? == name {
                        return self.data.get(data_off..data_off + len);
                    }
                    off = align4(data_off + len);
                }
                FDT_NOP => off += 4,
                _ => return None,
            }
        }
    }

    /// True when the (possibly zero-length) property exists.
    pub fn has_property(&self, node: Node, name: &str) -> bool {
        self.property(node, name).is_some()
    }

    /// A big-endian `u32` property, converted to native order.
    pub fn read_u32(&self, node: Node, name: &str) -> Option<u32> {
        let data = self.property(node, name)?;
        if data.len() != 4 {
            return None;
        }
        Some(BigEndian::read_u32(data))
    }

    /// A string property, NUL terminator stripped.
    pub fn read_str(&self, node: Node, name: &str) -> Option<&'a str> {
        let data = self.property(node, name)?;
        let (body, nul) = data.split_at(data.len().checked_sub(1)?);
        if nul != [0] {
            return None;
        }
        core::str::from_utf8(body).ok()
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// The three facts the kernel needs out of the tree at boot. The console
/// identity is opaque to the core; it goes straight to the board layer.
#[derive(Copy, Clone, Debug)]
pub struct BoardConfig<'a> {
    pub system_clock_hz: u32,
    pub console_uart: &'a str,
    pub console_baud: u32,
}

impl<'a> BoardConfig<'a> {
    pub fn from_dtb(dtb: &'a [u8]) -> Option<Self> {
        let fdt = Fdt::new(dtb).ok()?;
        let clocks = fdt.find_node("/clocks")?;
        let console = fdt.find_node("/console")?;
        Some(Self {
            system_clock_hz: fdt.read_u32(clocks, "system-clock")?,
            console_uart: fdt.read_str(console, "uart")?,
            console_baud: fdt.read_u32(console, "baud")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal DTB builder for tests; mirrors what dtc emits for small
    /// trees.
    struct Builder {
        struct_block: Vec<u8>,
        strings: Vec<u8>,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                struct_block: Vec::new(),
                strings: Vec::new(),
            }
        }

        fn tok(&mut self, t: u32) {
            self.struct_block.extend_from_slice(&t.to_be_bytes());
        }

        fn begin(&mut self, name: &str) {
            self.tok(FDT_BEGIN_NODE);
            self.struct_block.extend_from_slice(name.as_bytes());
            self.struct_block.push(0);
            while self.struct_block.len() % 4 != 0 {
                self.struct_block.push(0);
            }
        }

        fn end(&mut self) {
            self.tok(FDT_END_NODE);
        }

        fn string_off(&mut self, name: &str) -> u32 {
            let off = self.strings.len() as u32;
            self.strings.extend_from_slice(name.as_bytes());
            self.strings.push(0);
            off
        }

        fn prop(&mut self, name: &str, data: &[u8]) {
            let name_off = self.string_off(name);
            self.tok(FDT_PROP);
            self.tok(data.len() as u32);
            self.tok(name_off);
            self.struct_block.extend_from_slice(data);
            while self.struct_block.len() % 4 != 0 {
                self.struct_block.push(0);
            }
        }

        fn prop_u32(&mut self, name: &str, v: u32) {
            self.prop(name, &v.to_be_bytes());
        }

        fn prop_str(&mut self, name: &str, v: &str) {
            let mut data = v.as_bytes().to_vec();
            data.push(0);
            self.prop(name, &data);
        }

        fn finish(mut self) -> Vec<u8> {
            self.tok(FDT_END);
            let struct_off = 40u32;
            let struct_size = self.struct_block.len() as u32;
            let strings_off = struct_off + struct_size;
            let total = strings_off + self.strings.len() as u32;

            let mut out = Vec::new();
            for v in [
                FDT_MAGIC,
                total,
                struct_off,
                strings_off,
                total, // mem rsvmap: empty, point past the end
                17,    // version
                16,    // last compatible version
                0,     // boot cpu
                self.strings.len() as u32,
                struct_size,
            ] {
                out.extend_from_slice(&v.to_be_bytes());
            }
            out.extend_from_slice(&self.struct_block);
            out.extend_from_slice(&self.strings);
            out
        }
    }

    fn sample() -> Vec<u8> {
        let mut b = Builder::new();
        b.begin(""); // root
        b.prop_str("model", "stm32f407vet6");
        b.begin("clocks");
        b.prop_u32("system-clock", 168_000_000);
        b.end();
        b.begin("console");
        b.prop_str("uart", "usart1");
        b.prop_u32("baud", 115_200);
        b.prop("dma", &[]); // boolean property
        b.end();
        b.end();
        b.finish()
    }

    #[test]
    fn rejects_bad_blobs() {
        assert_eq!(Fdt::new(&[]).err(), Some(FdtError::BadHeader));
        let mut blob = sample();
        blob[0] = 0xAA; // break the magic
        assert_eq!(Fdt::new(&blob).err(), Some(FdtError::BadHeader));
        // Truncated below the advertised total size.
        let blob = sample();
        assert!(Fdt::new(&blob[..blob.len() - 8]).is_err());
    }

    #[test]
    fn finds_nodes_by_path() {
        let blob = sample();
        let fdt = Fdt::new(&blob).unwrap();
        assert!(fdt.find_node("/").is_some());
        assert!(fdt.find_node("/clocks").is_some());
        assert!(fdt.find_node("/console").is_some());
        assert!(fdt.find_node("/nonsense").is_none());
        assert!(fdt.find_node("/clocks/system-clock").is_none()); // a prop
    }

    #[test]
    fn reads_typed_properties() {
        let blob = sample();
        let fdt = Fdt::new(&blob).unwrap();
        let clocks = fdt.find_node("/clocks").unwrap();
        let console = fdt.find_node("/console").unwrap();

        assert_eq!(fdt.read_u32(clocks, "system-clock"), Some(168_000_000));
        assert_eq!(fdt.read_str(console, "uart"), Some("usart1"));
        assert_eq!(fdt.read_u32(console, "baud"), Some(115_200));
        assert!(fdt.has_property(console, "dma"));
        assert!(!fdt.has_property(console, "rts"));
        // Type confusion fails instead of misreading.
        assert_eq!(fdt.read_u32(console, "uart"), None);
        assert_eq!(fdt.read_u32(console, "missing"), None);
    }

    #[test]
    fn root_properties_do_not_leak_into_children() {
        let blob = sample();
        let fdt = Fdt::new(&blob).unwrap();
        let root = fdt.find_node("/").unwrap();
        let clocks = fdt.find_node("/clocks").unwrap();
        assert_eq!(fdt.read_str(root, "model"), Some("stm32f407vet6"));
        assert_eq!(fdt.read_str(clocks, "model"), None);
    }

    #[test]
    fn board_config_extraction() {
        let blob = sample();
        let cfg = BoardConfig::from_dtb(&blob).unwrap();
        assert_eq!(cfg.system_clock_hz, 168_000_000);
        assert_eq!(cfg.console_uart, "usart1");
        assert_eq!(cfg.console_baud, 115_200);

        // A tree missing /console is not a usable board description.
        let mut b = Builder::new();
        b.begin("");
        b.begin("clocks");
        b.prop_u32("system-clock", 1);
        b.end();
        b.end();
        assert!(BoardConfig::from_dtb(&b.finish()).is_none());
    }
}

//! Just enough of a HID report descriptor walker to find the Usage Page and
//! Usage an interface declares.
//!
//! See https://www.usb.org/sites/default/files/documents/hid1_11.pdf section 6.2.2

pub const FIDO_USAGE_PAGE: u32 = 0xf1d0;
pub const FIDO_USAGE_U2FHID: u32 = 0x01;

// The 4 MSBs (the tag) are set when it's a long item.
const HID_MASK_LONG_ITEM_TAG: u8 = 0b1111_0000;
// The 2 LSBs denote the size of a short item.
const HID_MASK_SHORT_ITEM_SIZE: u8 = 0b0000_0011;
// The 6 MSBs denote the tag (4) and type (2).
const HID_MASK_ITEM_TAGTYPE: u8 = 0b1111_1100;
// tag=0000, type=10 (local)
const HID_ITEM_TAGTYPE_USAGE: u8 = 0b0000_1000;
// tag=0000, type=01 (global)
const HID_ITEM_TAGTYPE_USAGE_PAGE: u8 = 0b0000_0100;

const LONG_ITEM_HEADER_LEN: usize = 3;
const SHORT_ITEM_HEADER_LEN: usize = 1;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HidUsage {
    pub usage_page: Option<u32>,
    pub usage: Option<u32>,
}

impl HidUsage {
    pub fn is_fido(&self) -> bool {
        self.usage_page == Some(FIDO_USAGE_PAGE) && self.usage == Some(FIDO_USAGE_U2FHID)
    }
}

pub fn classify(descriptor: &[u8]) -> HidUsage {
    HidUsage {
        usage_page: usage_page(descriptor),
        usage: usage(descriptor),
    }
}

pub fn usage_page(descriptor: &[u8]) -> Option<u32> {
    find_item(descriptor, HID_ITEM_TAGTYPE_USAGE_PAGE)
}

pub fn usage(descriptor: &[u8]) -> Option<u32> {
    find_item(descriptor, HID_ITEM_TAGTYPE_USAGE)
}

/// Value of the first item whose tag and type match `tag_type`.
fn find_item(descriptor: &[u8], tag_type: u8) -> Option<u32> {
    let mut offset = 0;
    while offset < descriptor.len() {
        let prefix = descriptor[offset];
        let (header_len, data_len) = if prefix & HID_MASK_LONG_ITEM_TAG == HID_MASK_LONG_ITEM_TAG {
            let data_len = descriptor.get(offset + 1).map_or(0, |len| *len as usize);
            (LONG_ITEM_HEADER_LEN, data_len)
        } else {
            let data_len = match prefix & HID_MASK_SHORT_ITEM_SIZE {
                3 => 4,
                size_code => size_code as usize,
            };
            (SHORT_ITEM_HEADER_LEN, data_len)
        };

        if prefix & HID_MASK_ITEM_TAGTYPE == tag_type {
            return Some(read_item_data(descriptor, offset, data_len));
        }

        offset += header_len + data_len;
    }
    None
}

/// Little-endian value of the `len` bytes following the prefix at `offset`,
/// zero when they run past the end of the descriptor.
fn read_item_data(descriptor: &[u8], offset: usize, len: usize) -> u32 {
    match descriptor.get(offset + 1..offset + 1 + len) {
        Some(data) => data
            .iter()
            .rev()
            .fold(0u32, |value, byte| value << 8 | u32::from(*byte)),
        None => 0,
    }
}

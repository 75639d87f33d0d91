//! # Firmware images
//!
//! Parsing firmware files is left to the caller. A [`FirmwareImage`] is the
//! parsed result: an ordered list of sections, of which only the first one is
//! flashed.

/// A contiguous block of image data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Flash address of the first byte
    pub offset: u32,
    /// Section content
    pub data: Vec<u8>,
}

impl Section {
    /// Address one past the last byte, `None` if it does not fit in 32 bits
    pub fn end(&self) -> Option<u32> {
        u32::try_from(self.data.len()).ok().and_then(|len| self.offset.checked_add(len))
    }
}

/// A parsed firmware image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Sections in file order
    pub sections: Vec<Section>,
}

impl FirmwareImage {
    /// Image from parsed sections
    pub fn new(sections: Vec<Section>) -> Self {
        FirmwareImage { sections }
    }

    /// Image made of one raw binary loaded at `offset`
    pub fn from_binary(offset: u32, data: Vec<u8>) -> Self {
        FirmwareImage { sections: vec![Section { offset, data }] }
    }

    /// The section written by an update
    pub fn first_section(&self) -> Option<&Section> {
        self.sections.first()
    }
}

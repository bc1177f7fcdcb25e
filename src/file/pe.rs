//! Raw PE image access for payloads that live outside managed metadata.
//!
//! Some protectors keep their data in RVA-backed fields or patch native stubs directly
//! into the image. [`PeImage`] keeps the raw bytes together with the section table and the
//! location of the CLR header structures, so that reads can go through RVAs and writes can
//! be checked against the regions the metadata writer relies on.
//!
//! The header parsing itself is done by whoever loads the binary; this type only consumes
//! the result.

use std::ops::Range;

use crate::{
    file::io::{read_le_at, write_le_at},
    Error, Result,
};

/// One entry of the PE section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section name as displayed (e.g. `.text`)
    pub name: String,
    /// RVA of the first byte of the section
    pub virtual_address: u32,
    /// Size of the section once mapped
    pub virtual_size: u32,
    /// File offset of the raw section data
    pub pointer_to_raw_data: u32,
    /// Size of the raw section data on disk
    pub size_of_raw_data: u32,
}

impl SectionHeader {
    /// Returns true if `rva` is mapped by this section.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        let size = self.virtual_size.max(self.size_of_raw_data);
        rva >= self.virtual_address && u64::from(rva) < u64::from(self.virtual_address) + u64::from(size)
    }

    /// Returns true if the file range `offset..offset+length` lies inside the raw section data.
    #[must_use]
    pub fn contains_offset_range(&self, offset: u32, length: u32) -> bool {
        let end = u64::from(offset) + u64::from(length);
        offset >= self.pointer_to_raw_data
            && end <= u64::from(self.pointer_to_raw_data) + u64::from(self.size_of_raw_data)
    }
}

/// File ranges of the CLR structures that must not be overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotNetLayout {
    /// RVA of the COR20 header (data directory 14)
    pub cor20_rva: u32,
    /// File range of the COR20 header
    pub cor20_header: Range<u32>,
    /// File range of the metadata root header
    pub metadata_header: Range<u32>,
}

/// A mutable PE image with section-aware addressing.
#[derive(Debug, Clone)]
pub struct PeImage {
    data: Vec<u8>,
    sections: Vec<SectionHeader>,
    dotnet: Option<DotNetLayout>,
}

impl PeImage {
    /// Create an image from raw bytes and an already parsed section table.
    #[must_use]
    pub fn new(data: Vec<u8>, sections: Vec<SectionHeader>, dotnet: Option<DotNetLayout>) -> Self {
        PeImage {
            data,
            sections,
            dotnet,
        }
    }

    /// The raw image bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the image holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The section table in file order.
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// Find the section mapping `rva`.
    #[must_use]
    pub fn find_section_by_rva(&self, rva: u32) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Find a section by its display name.
    #[must_use]
    pub fn find_section_by_name(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Raw bytes of a section, clamped to the image.
    #[must_use]
    pub fn section_data(&self, section: &SectionHeader) -> &[u8] {
        let start = (section.pointer_to_raw_data as usize).min(self.data.len());
        let end = start
            .saturating_add(section.size_of_raw_data as usize)
            .min(self.data.len());
        &self.data[start..end]
    }

    /// Translate an RVA into a file offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidOffset`] if no section maps the RVA.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u32> {
        let section = self.find_section_by_rva(rva).ok_or(Error::InvalidOffset)?;
        Ok(rva - section.virtual_address + section.pointer_to_raw_data)
    }

    /// Read a `u16` at `rva`.
    ///
    /// # Errors
    /// Returns an error if the RVA is unmapped or the read leaves the image.
    pub fn read_u16(&self, rva: u32) -> Result<u16> {
        let mut offset = self.rva_to_offset(rva)? as usize;
        read_le_at(&self.data, &mut offset)
    }

    /// Read a `u32` at `rva`.
    ///
    /// # Errors
    /// Returns an error if the RVA is unmapped or the read leaves the image.
    pub fn read_u32(&self, rva: u32) -> Result<u32> {
        let mut offset = self.rva_to_offset(rva)? as usize;
        read_le_at(&self.data, &mut offset)
    }

    /// Read `size` bytes at `rva`.
    ///
    /// # Errors
    /// Returns an error if the RVA is unmapped or the read leaves the image.
    pub fn read_bytes(&self, rva: u32, size: usize) -> Result<&[u8]> {
        let offset = self.rva_to_offset(rva)? as usize;
        self.offset_read_bytes(offset, size)
    }

    /// Read `size` bytes at a file offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the read leaves the image.
    pub fn offset_read_bytes(&self, offset: usize, size: usize) -> Result<&[u8]> {
        let end = offset.checked_add(size).ok_or(out_of_bounds_error!())?;
        self.data.get(offset..end).ok_or(out_of_bounds_error!())
    }

    /// Write a `u16` at `rva`.
    ///
    /// # Errors
    /// Returns an error if the RVA is unmapped or the write leaves the image.
    pub fn write_u16(&mut self, rva: u32, value: u16) -> Result<()> {
        let mut offset = self.rva_to_offset(rva)? as usize;
        write_le_at(&mut self.data, &mut offset, value)
    }

    /// Write a `u32` at `rva`.
    ///
    /// # Errors
    /// Returns an error if the RVA is unmapped or the write leaves the image.
    pub fn write_u32(&mut self, rva: u32, value: u32) -> Result<()> {
        let mut offset = self.rva_to_offset(rva)? as usize;
        write_le_at(&mut self.data, &mut offset, value)
    }

    /// Copy `bytes` to a file offset without any collision checks.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the write leaves the image.
    pub fn offset_write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(out_of_bounds_error!())?;
        let target = self
            .data
            .get_mut(start..end)
            .ok_or(out_of_bounds_error!())?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Write `bytes` at a file offset unless it would corrupt the CLR structures.
    ///
    /// For images with a CLR header the range must lie inside the section holding the
    /// COR20 header, and must not intersect the COR20 header or the metadata root header.
    /// Returns `Ok(false)` when the write was refused.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the write leaves the image.
    pub fn dotnet_safe_write_offset(&mut self, offset: u32, bytes: &[u8]) -> Result<bool> {
        if let Some(layout) = &self.dotnet {
            let length = u32::try_from(bytes.len()).map_err(|_| out_of_bounds_error!())?;
            let Some(section) = self.find_section_by_rva(layout.cor20_rva) else {
                return Ok(false);
            };
            if !section.contains_offset_range(offset, length) {
                return Ok(false);
            }
            if intersects(offset, length, &layout.cor20_header)
                || intersects(offset, length, &layout.metadata_header)
            {
                return Ok(false);
            }
        }

        self.offset_write(offset, bytes)?;
        Ok(true)
    }

    /// RVA flavour of [`PeImage::dotnet_safe_write_offset`].
    ///
    /// # Errors
    /// Returns an error if the RVA is unmapped or the write leaves the image.
    pub fn dotnet_safe_write(&mut self, rva: u32, bytes: &[u8]) -> Result<bool> {
        let offset = self.rva_to_offset(rva)?;
        self.dotnet_safe_write_offset(offset, bytes)
    }
}

/// `IMAGE_FILE_DLL` in the COFF characteristics.
const IMAGE_FILE_DLL: u16 = 0x2000;

/// The file extension an unpacked image should be saved with: `.dll` when the COFF header
/// marks it as a library, `.exe` otherwise.
///
/// # Errors
/// Returns [`crate::Error::NotSupported`] if `data` has no PE signature, or a bounds error
/// for a truncated header.
pub fn image_extension(data: &[u8]) -> Result<&'static str> {
    let mut offset = 0x3C;
    let pe_offset = read_le_at::<u32>(data, &mut offset)? as usize;
    let mut offset = pe_offset;
    if read_le_at::<u32>(data, &mut offset)? != 0x0000_4550 {
        return Err(Error::NotSupported);
    }
    let mut offset = pe_offset + 22;
    let characteristics = read_le_at::<u16>(data, &mut offset)?;
    Ok(if characteristics & IMAGE_FILE_DLL != 0 {
        ".dll"
    } else {
        ".exe"
    })
}

fn intersects(offset: u32, length: u32, range: &Range<u32>) -> bool {
    let end = u64::from(offset) + u64::from(length);
    !(end <= u64::from(range.start) || u64::from(range.end) <= u64::from(offset))
}

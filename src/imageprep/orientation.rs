//! EXIF orientation tag extraction from JPEG APP1 segments
//!
//! Only the orientation tag (0x0112) is read; everything else in the
//! metadata is ignored and stripped by re-encoding.

const ORIENTATION_TAG: u16 = 0x0112;

/// Returns the raw orientation value (1..=8) when the JPEG carries one.
pub fn exif_orientation(jpeg: &[u8]) -> Option<u16> {
    // SOI marker
    if jpeg.len() < 4 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= jpeg.len() {
        if jpeg[pos] != 0xFF {
            return None;
        }
        let marker = jpeg[pos + 1];
        // Standalone markers carry no length
        if (0xD0..=0xD9).contains(&marker) {
            pos += 2;
            continue;
        }
        // Entropy-coded data begins at SOS; no APP1 past this point
        if marker == 0xDA {
            return None;
        }

        let length = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        if length < 2 || pos + 2 + length > jpeg.len() {
            return None;
        }

        if marker == 0xE1 {
            let segment = &jpeg[pos + 4..pos + 2 + length];
            if let Some(value) = orientation_from_app1(segment) {
                return Some(value);
            }
        }
        pos += 2 + length;
    }
    None
}

fn orientation_from_app1(segment: &[u8]) -> Option<u16> {
    let tiff = segment.strip_prefix(b"Exif\0\0")?;
    if tiff.len() < 8 {
        return None;
    }

    let big_endian = match &tiff[0..2] {
        b"MM" => true,
        b"II" => false,
        _ => return None,
    };
    let read_u16 = |bytes: &[u8]| -> u16 {
        let pair = [bytes[0], bytes[1]];
        if big_endian { u16::from_be_bytes(pair) } else { u16::from_le_bytes(pair) }
    };
    let read_u32 = |bytes: &[u8]| -> u32 {
        let quad = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if big_endian { u32::from_be_bytes(quad) } else { u32::from_le_bytes(quad) }
    };

    if read_u16(&tiff[2..4]) != 42 {
        return None;
    }

    let ifd_offset = read_u32(&tiff[4..8]) as usize;
    if ifd_offset + 2 > tiff.len() {
        return None;
    }

    let entry_count = read_u16(&tiff[ifd_offset..ifd_offset + 2]) as usize;
    for i in 0..entry_count {
        let entry = ifd_offset + 2 + i * 12;
        if entry + 12 > tiff.len() {
            return None;
        }
        if read_u16(&tiff[entry..entry + 2]) == ORIENTATION_TAG {
            let value = read_u16(&tiff[entry + 8..entry + 10]);
            return (1..=8).contains(&value).then_some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal JPEG: SOI + APP1(EXIF with one orientation entry) + EOI
    fn jpeg_with_orientation(orientation: u16) -> Vec<u8> {
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"MM");
        tiff.extend_from_slice(&42u16.to_be_bytes());
        tiff.extend_from_slice(&8u32.to_be_bytes());
        tiff.extend_from_slice(&1u16.to_be_bytes());
        tiff.extend_from_slice(&ORIENTATION_TAG.to_be_bytes());
        tiff.extend_from_slice(&3u16.to_be_bytes()); // SHORT
        tiff.extend_from_slice(&1u32.to_be_bytes()); // count
        tiff.extend_from_slice(&orientation.to_be_bytes());
        tiff.extend_from_slice(&[0, 0]); // value padding
        tiff.extend_from_slice(&0u32.to_be_bytes()); // next IFD

        let mut segment = Vec::new();
        segment.extend_from_slice(b"Exif\0\0");
        segment.extend_from_slice(&tiff);

        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend_from_slice(&[0xFF, 0xE1]);
        jpeg.extend_from_slice(&((segment.len() + 2) as u16).to_be_bytes());
        jpeg.extend_from_slice(&segment);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn reads_orientation_tag() {
        for orientation in 1..=8u16 {
            let jpeg = jpeg_with_orientation(orientation);
            assert_eq!(exif_orientation(&jpeg), Some(orientation));
        }
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert_eq!(exif_orientation(&jpeg_with_orientation(0)), None);
        assert_eq!(exif_orientation(&jpeg_with_orientation(9)), None);
    }

    #[test]
    fn tolerates_missing_exif() {
        assert_eq!(exif_orientation(&[0xFF, 0xD8, 0xFF, 0xD9]), None);
        assert_eq!(exif_orientation(b"not a jpeg"), None);
        assert_eq!(exif_orientation(&[]), None);
    }

    #[test]
    fn truncated_segments_do_not_panic() {
        let mut jpeg = jpeg_with_orientation(6);
        jpeg.truncate(12);
        assert_eq!(exif_orientation(&jpeg), None);
    }
}

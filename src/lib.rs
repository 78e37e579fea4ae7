// SPDX-License-Identifier: MIT

//! An Excel embedded-image extractor.
//!
//! Pulls raster images out of both Excel container formats and
//! correlates each one with the cell anchors that place it on a sheet:
//!
//! - **`.xlsx`**: the OOXML package, a ZIP of XML parts whose drawing
//!   parts reference media entries through relationship files;
//! - **`.xls`**: the legacy OLE2 compound file, whose `/Workbook`
//!   stream holds BIFF records carrying Office-Art (Escher) drawing
//!   trees and a global image store.
//!
//! ```no_run
//! let result = xlpic::extract_images("report.xlsx", None)?;
//! for image in &result.images {
//!     println!("{} ({}): {} anchor(s)", image.name, image.mime, image.positions.len());
//! }
//! # Ok::<(), xlpic::Error>(())
//! ```

#![warn(missing_docs)]

macro_rules! from_err {
    ($from:ty, $to:tt, $var:tt) => {
        impl From<$from> for $to {
            fn from(e: $from) -> $to {
                $to::$var(e)
            }
        }
    };
}

pub mod cfb;
mod errors;
mod escher;
mod utils;
pub mod xls;
pub mod xlsx;

use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Serialize, Serializer};

pub use crate::errors::{Error, ErrorKind};

/// Ceiling on the cumulative **base64-encoded** size of the emitted
/// image payloads. Once adding an image would cross it, that image and
/// everything after it are dropped and the result is flagged truncated.
///
/// The comparison deliberately uses the encoded length (roughly 4/3 of
/// the raw byte count), since that is what a transport ships.
pub const IMAGE_DATA_BUDGET: usize = 10 * 1024 * 1024;

/// MIME type of an extracted image, from the fixed set this engine can
/// classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMime {
    /// `image/png`
    Png,
    /// `image/jpeg`
    Jpeg,
    /// `image/gif`
    Gif,
    /// `image/bmp` (also covers raw DIB payloads)
    Bmp,
    /// `image/tiff`
    Tiff,
    /// `image/x-emf`
    Emf,
    /// `image/x-wmf`
    Wmf,
    /// `image/pict`
    Pict,
    /// `image/svg+xml`
    Svg,
    /// `application/octet-stream`
    Unknown,
}

impl ImageMime {
    /// The MIME string, e.g. `image/png`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMime::Png => "image/png",
            ImageMime::Jpeg => "image/jpeg",
            ImageMime::Gif => "image/gif",
            ImageMime::Bmp => "image/bmp",
            ImageMime::Tiff => "image/tiff",
            ImageMime::Emf => "image/x-emf",
            ImageMime::Wmf => "image/x-wmf",
            ImageMime::Pict => "image/pict",
            ImageMime::Svg => "image/svg+xml",
            ImageMime::Unknown => "application/octet-stream",
        }
    }

    /// The extension used in synthetic display names.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageMime::Png => "png",
            ImageMime::Jpeg => "jpeg",
            ImageMime::Gif => "gif",
            ImageMime::Bmp => "bmp",
            ImageMime::Tiff => "tiff",
            ImageMime::Emf => "emf",
            ImageMime::Wmf => "wmf",
            ImageMime::Pict => "pict",
            ImageMime::Svg => "svg",
            ImageMime::Unknown => "bin",
        }
    }

    /// Classifies a media file extension (case insensitive).
    pub fn from_extension(ext: &str) -> ImageMime {
        match ext.to_ascii_lowercase().as_str() {
            "png" => ImageMime::Png,
            "jpg" | "jpeg" => ImageMime::Jpeg,
            "gif" => ImageMime::Gif,
            "bmp" => ImageMime::Bmp,
            "tif" | "tiff" => ImageMime::Tiff,
            "emf" => ImageMime::Emf,
            "wmf" => ImageMime::Wmf,
            "svg" => ImageMime::Svg,
            _ => ImageMime::Unknown,
        }
    }

    /// True for the vector metafile formats most consumers cannot
    /// display inline.
    pub fn is_metafile(&self) -> bool {
        matches!(self, ImageMime::Emf | ImageMime::Wmf)
    }
}

impl fmt::Display for ImageMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ImageMime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One cell anchor of an image: the sheet it sits on and the inclusive
/// cell rectangle, zero-based. One-cell anchors have `to == from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePosition {
    /// Worksheet name
    pub sheet: String,
    /// First row of the rectangle
    pub from_row: u32,
    /// First column of the rectangle
    pub from_col: u32,
    /// Last row of the rectangle, `>= from_row`
    pub to_row: u32,
    /// Last column of the rectangle, `>= from_col`
    pub to_col: u32,
}

impl ImagePosition {
    /// Builds a position, swapping corners if they arrive reversed so
    /// that `from <= to` holds on both axes.
    pub(crate) fn new(sheet: String, from_row: u32, from_col: u32, to_row: u32, to_col: u32) -> Self {
        ImagePosition {
            sheet,
            from_row: from_row.min(to_row),
            from_col: from_col.min(to_col),
            to_row: from_row.max(to_row),
            to_col: from_col.max(to_col),
        }
    }
}

/// One extracted image with its transport-ready payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedImage {
    /// Synthetic display name, `image<N>.<ext>` in emission order
    pub name: String,
    /// MIME type
    #[serde(rename = "mimeType")]
    pub mime: ImageMime,
    /// Image bytes, base64 encoded
    pub data: String,
    /// Every cell anchor referencing this image; empty for media
    /// entries nothing points at
    pub positions: Vec<ImagePosition>,
}

/// The outcome of an extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionResult {
    /// Extracted images, ordered as defined by the source format
    pub images: Vec<ExtractedImage>,
    /// True when the size budget cut the list short
    pub truncated: bool,
}

/// An image as delivered by a format pipeline, before encoding and
/// budget enforcement.
pub(crate) struct RawImage {
    pub mime: ImageMime,
    pub bytes: Vec<u8>,
    pub positions: Vec<ImagePosition>,
}

/// Extracts every embedded image of the workbook at `path`, together
/// with its cell anchors.
///
/// With `sheet_name` set, only anchors on that sheet are considered
/// and images without any surviving anchor are dropped; the name must
/// exist in the workbook. Without a filter, the OOXML path also
/// reports `xl/media/*` entries nothing references, with empty
/// position lists; the legacy path reports only anchored images.
///
/// The cumulative base64 payload is capped at [`IMAGE_DATA_BUDGET`];
/// see [`ExtractionResult::truncated`].
pub fn extract_images<P: AsRef<Path>>(
    path: P,
    sheet_name: Option<&str>,
) -> Result<ExtractionResult, Error> {
    let data = read_file(path.as_ref())?;
    let raw = match detect(&data)? {
        FileKind::Ooxml => xlsx::extract(&data, sheet_name)?,
        FileKind::Legacy => xls::extract(&data, sheet_name)?,
    };
    Ok(assemble(raw))
}

/// Lists the workbook's worksheet names, in workbook order.
pub fn sheet_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>, Error> {
    let data = read_file(path.as_ref())?;
    match detect(&data)? {
        FileKind::Ooxml => xlsx::sheet_names(&data),
        FileKind::Legacy => xls::sheet_names(&data),
    }
}

/// Excel file types
enum FileKind {
    /// ZIP package (xlsx, xlsm, xlam)
    Ooxml,
    /// Compound File Binary (xls)
    Legacy,
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::FileNotFound(path.display().to_string()))
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Dispatches on the first four bytes: a ZIP local-file header means
/// OOXML, the compound-file magic means legacy, anything else is not
/// an Excel file this engine reads.
fn detect(data: &[u8]) -> Result<FileKind, Error> {
    if data.len() < 4 {
        return Err(Error::InvalidFile);
    }
    if data.starts_with(&[0x50, 0x4B]) {
        Ok(FileKind::Ooxml)
    } else if data.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        Ok(FileKind::Legacy)
    } else {
        Err(Error::InvalidFile)
    }
}

/// Encodes, names and emits images in pipeline order until the size
/// budget is hit.
fn assemble(raw: Vec<RawImage>) -> ExtractionResult {
    let mut images = Vec::with_capacity(raw.len());
    let mut used = 0usize;
    let mut truncated = false;
    for img in raw {
        let data = BASE64.encode(&img.bytes);
        if used + data.len() > IMAGE_DATA_BUDGET {
            truncated = true;
            break;
        }
        used += data.len();
        images.push(ExtractedImage {
            name: format!("image{}.{}", images.len() + 1, img.mime.extension()),
            mime: img.mime,
            data,
            positions: img.positions,
        });
    }
    ExtractionResult { images, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(mime: ImageMime, len: usize) -> RawImage {
        RawImage {
            mime,
            bytes: vec![0xAB; len],
            positions: Vec::new(),
        }
    }

    #[test]
    fn test_detect() {
        assert!(matches!(detect(b"PK\x03\x04rest"), Ok(FileKind::Ooxml)));
        assert!(matches!(
            detect(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1]),
            Ok(FileKind::Legacy)
        ));
        assert!(matches!(detect(b"PK"), Err(Error::InvalidFile)));
        assert!(matches!(detect(b"%PDF-1.7"), Err(Error::InvalidFile)));
        assert!(matches!(detect(b""), Err(Error::InvalidFile)));
    }

    #[test]
    fn test_assemble_names_and_order() {
        let result = assemble(vec![raw(ImageMime::Png, 10), raw(ImageMime::Jpeg, 10)]);
        assert!(!result.truncated);
        assert_eq!(result.images[0].name, "image1.png");
        assert_eq!(result.images[1].name, "image2.jpeg");
        assert_eq!(result.images[0].data, BASE64.encode([0xAB; 10]));
    }

    #[test]
    fn test_assemble_budget() {
        // each encodes to just under half the budget
        let per_image = IMAGE_DATA_BUDGET / 2 / 4 * 3;
        let result = assemble(vec![
            raw(ImageMime::Png, per_image),
            raw(ImageMime::Png, per_image),
            raw(ImageMime::Png, per_image),
        ]);
        assert!(result.truncated);
        assert_eq!(result.images.len(), 2);
        let total: usize = result.images.iter().map(|i| i.data.len()).sum();
        assert!(total <= IMAGE_DATA_BUDGET);
    }

    #[test]
    fn test_assemble_stops_at_first_overflow() {
        let result = assemble(vec![
            raw(ImageMime::Png, IMAGE_DATA_BUDGET),
            raw(ImageMime::Png, 4),
        ]);
        assert!(result.truncated);
        assert!(result.images.is_empty());
    }

    #[test]
    fn test_position_normalization() {
        let p = ImagePosition::new("S".into(), 5, 4, 1, 2);
        assert!(p.from_row <= p.to_row && p.from_col <= p.to_col);
        assert_eq!((p.from_row, p.from_col, p.to_row, p.to_col), (1, 2, 5, 4));
    }

    #[test]
    fn test_serialized_shape() {
        let image = ExtractedImage {
            name: "image1.png".into(),
            mime: ImageMime::Png,
            data: "aGk=".into(),
            positions: vec![ImagePosition::new("Sheet1".into(), 0, 0, 3, 2)],
        };
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["mimeType"], "image/png");
        assert_eq!(json["positions"][0]["fromRow"], 0);
        assert_eq!(json["positions"][0]["toCol"], 2);
        assert_eq!(json["positions"][0]["sheet"], "Sheet1");
    }

    #[test]
    fn test_mime_maps() {
        assert_eq!(ImageMime::from_extension("PnG"), ImageMime::Png);
        assert_eq!(ImageMime::Bmp.as_str(), "image/bmp");
        assert_eq!(ImageMime::Unknown.as_str(), "application/octet-stream");
        assert_eq!(ImageMime::Jpeg.extension(), "jpeg");
        assert!(ImageMime::Emf.is_metafile());
        assert!(ImageMime::Wmf.is_metafile());
        assert!(!ImageMime::Png.is_metafile());
    }
}

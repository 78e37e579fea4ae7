// SPDX-License-Identifier: MIT

//! OOXML (`.xlsx`) pipeline.
//!
//! The package is a ZIP of XML parts. Sheet order comes from
//! `xl/workbook.xml`, each sheet's relationship file points at its
//! drawing parts, each drawing's relationship file maps `r:embed` ids
//! to entries under `xl/media/`, and the drawing XML itself carries
//! the cell anchors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read};

use log::warn;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader as XmlReader;
use zip::read::ZipArchive;
use zip::result::ZipError;

use crate::errors::Error;
use crate::{ImageMime, ImagePosition, RawImage};

type Zip<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// An enum for Xlsx specific errors
#[derive(Debug)]
pub enum XlsxError {
    /// IO error while reading an entry
    Io(std::io::Error),
    /// Error reading the zip container
    Zip(ZipError),
    /// Error parsing xml
    Xml(quick_xml::Error),
    /// Error parsing an xml attribute
    XmlAttr(quick_xml::events::attributes::AttrError),
    /// Error parsing an integer
    ParseInt(std::num::ParseIntError),
    /// Unexpected end of xml, with the expected closing tag
    XmlEof(&'static str),
    /// A required part is missing from the package
    FileNotFound(String),
}

from_err!(std::io::Error, XlsxError, Io);
from_err!(ZipError, XlsxError, Zip);
from_err!(quick_xml::Error, XlsxError, Xml);
from_err!(std::num::ParseIntError, XlsxError, ParseInt);

impl std::fmt::Display for XlsxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XlsxError::Io(e) => write!(f, "I/O error: {e}"),
            XlsxError::Zip(e) => write!(f, "Zip error: {e}"),
            XlsxError::Xml(e) => write!(f, "Xml error: {e}"),
            XlsxError::XmlAttr(e) => write!(f, "Xml attribute error: {e}"),
            XlsxError::ParseInt(e) => write!(f, "Parse integer error: {e}"),
            XlsxError::XmlEof(e) => write!(f, "Unexpected end of xml, expecting '</{e}>'"),
            XlsxError::FileNotFound(e) => write!(f, "File not found '{e}'"),
        }
    }
}

impl std::error::Error for XlsxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            XlsxError::Io(e) => Some(e),
            XlsxError::Zip(e) => Some(e),
            XlsxError::Xml(e) => Some(e),
            XlsxError::XmlAttr(e) => Some(e),
            XlsxError::ParseInt(e) => Some(e),
            _ => None,
        }
    }
}

/// Extracts all images of an OOXML package together with their anchors.
///
/// Anchored images come first, in the order the drawings reference
/// them; when no sheet filter is active the unreferenced `xl/media/*`
/// entries follow with empty position lists.
pub(crate) fn extract(data: &[u8], filter: Option<&str>) -> Result<Vec<RawImage>, Error> {
    let mut zip = ZipArchive::new(Cursor::new(data)).map_err(XlsxError::Zip)?;
    let relationships = workbook_relationships(&mut zip)?;
    let sheets = workbook_sheets(&mut zip, &relationships)?;

    if let Some(name) = filter {
        if !sheets.iter().any(|(n, _)| n == name) {
            return Err(Error::SheetNotFound(name.to_string()));
        }
    }

    // discovery-ordered anchored media paths and their positions
    let mut order: Vec<String> = Vec::new();
    let mut positions: HashMap<String, Vec<ImagePosition>> = HashMap::new();
    for (sheet_name, sheet_path) in &sheets {
        if filter.is_some_and(|f| f != sheet_name) {
            continue;
        }
        for drawing_path in sheet_drawings(&mut zip, sheet_path)? {
            let media = drawing_relationships(&mut zip, &drawing_path)?;
            let Some(xml) = read_entry(&mut zip, &drawing_path) else {
                continue;
            };
            for (rid, rect) in drawing_anchors(&xml)? {
                let Some(media_path) = media.get(&rid) else {
                    warn!("drawing '{drawing_path}' references unknown id {rid}");
                    continue;
                };
                if !positions.contains_key(media_path) {
                    order.push(media_path.clone());
                }
                positions
                    .entry(media_path.clone())
                    .or_default()
                    .push(ImagePosition::new(
                        sheet_name.clone(),
                        rect.from_row,
                        rect.from_col,
                        rect.to_row,
                        rect.to_col,
                    ));
            }
        }
    }

    let mut images = Vec::new();
    let mut emitted: HashSet<String> = HashSet::new();
    for path in &order {
        let Some(bytes) = read_entry(&mut zip, path) else {
            warn!("media entry '{path}' is missing from the package");
            continue;
        };
        emitted.insert(path.clone());
        images.push(RawImage {
            mime: mime_from_path(path),
            bytes,
            positions: positions.remove(path).unwrap_or_default(),
        });
    }

    if filter.is_none() {
        for i in 0..zip.len() {
            let mut file = zip.by_index(i).map_err(XlsxError::Zip)?;
            let name = file.name().to_string();
            if !name.starts_with("xl/media/") || emitted.contains(&name) {
                continue;
            }
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).map_err(XlsxError::from)?;
            images.push(RawImage {
                mime: mime_from_path(&name),
                bytes,
                positions: Vec::new(),
            });
        }
    }
    Ok(images)
}

/// Lists the workbook's sheet names, in workbook order.
pub(crate) fn sheet_names(data: &[u8]) -> Result<Vec<String>, Error> {
    let mut zip = ZipArchive::new(Cursor::new(data)).map_err(XlsxError::Zip)?;
    let relationships = workbook_relationships(&mut zip)?;
    let sheets = workbook_sheets(&mut zip, &relationships)?;
    Ok(sheets.into_iter().map(|(name, _)| name).collect())
}

fn read_entry(zip: &mut Zip<'_>, path: &str) -> Option<Vec<u8>> {
    match zip.by_name(path) {
        Ok(mut f) => {
            let mut buf = Vec::with_capacity(f.size() as usize);
            f.read_to_end(&mut buf).ok()?;
            Some(buf)
        }
        Err(ZipError::FileNotFound) => None,
        Err(e) => {
            warn!("cannot read '{path}': {e}");
            None
        }
    }
}

fn xml_reader(bytes: &[u8]) -> XmlReader<&[u8]> {
    let mut r = XmlReader::from_reader(bytes);
    let config = r.config_mut();
    config.check_end_names = false;
    config.trim_text(false);
    config.check_comments = false;
    config.expand_empty_elements = true;
    r
}

/// Reads `xl/_rels/workbook.xml.rels` into an id -> target map.
fn workbook_relationships(zip: &mut Zip<'_>) -> Result<BTreeMap<Vec<u8>, String>, XlsxError> {
    let path = "xl/_rels/workbook.xml.rels";
    let Some(xml) = read_entry(zip, path) else {
        return Err(XlsxError::FileNotFound(path.to_string()));
    };
    let mut relationships = BTreeMap::new();
    for (id, target, _) in read_relationship_entries(&xml)? {
        relationships.insert(id.into_bytes(), target);
    }
    Ok(relationships)
}

/// Reads the ordered `(name, path)` sheet list from `xl/workbook.xml`.
fn workbook_sheets(
    zip: &mut Zip<'_>,
    relationships: &BTreeMap<Vec<u8>, String>,
) -> Result<Vec<(String, String)>, XlsxError> {
    let Some(xml) = read_entry(zip, "xl/workbook.xml") else {
        return Err(XlsxError::FileNotFound("xl/workbook.xml".to_string()));
    };
    let mut sheets = Vec::new();
    let mut reader = xml_reader(&xml);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"sheet" => {
                let mut name = String::new();
                let mut rid = Vec::new();
                for a in e.attributes() {
                    let a = a.map_err(XlsxError::XmlAttr)?;
                    match a {
                        Attribute {
                            key: QName(b"name"),
                            ..
                        } => name = a.decode_and_unescape_value(reader.decoder())?.to_string(),
                        Attribute {
                            key: QName(b"r:id"),
                            value: ref v,
                        }
                        | Attribute {
                            key: QName(b"relationships:id"),
                            value: ref v,
                        } => rid = v.to_vec(),
                        _ => (),
                    }
                }
                match relationships.get(&rid) {
                    Some(target) => sheets.push((name, resolve_path("xl", target))),
                    None => warn!("sheet '{name}' has no matching relationship"),
                }
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"workbook" => break,
            Ok(Event::Eof) => return Err(XlsxError::XmlEof("workbook")),
            Err(e) => return Err(XlsxError::Xml(e)),
            _ => (),
        }
    }
    Ok(sheets)
}

/// The drawing parts referenced by one sheet, resolved to archive paths.
fn sheet_drawings(zip: &mut Zip<'_>, sheet_path: &str) -> Result<Vec<String>, XlsxError> {
    let Some(xml) = read_entry(zip, &rels_path(sheet_path)) else {
        return Ok(Vec::new());
    };
    let base = dirname(sheet_path);
    let mut drawings = Vec::new();
    for (_, target, _) in read_relationship_entries(&xml)? {
        if target.contains("drawing") {
            drawings.push(resolve_path(base, &target));
        }
    }
    Ok(drawings)
}

/// The id -> media path map of one drawing part.
fn drawing_relationships(
    zip: &mut Zip<'_>,
    drawing_path: &str,
) -> Result<HashMap<String, String>, XlsxError> {
    let Some(xml) = read_entry(zip, &rels_path(drawing_path)) else {
        // without relationships the drawing cannot contribute anchors
        return Ok(HashMap::new());
    };
    let base = dirname(drawing_path);
    let mut media = HashMap::new();
    for (id, target, _) in read_relationship_entries(&xml)? {
        media.insert(id, resolve_path(base, &target));
    }
    Ok(media)
}

/// Parses `Relationship` elements into `(id, target, type)` tuples.
fn read_relationship_entries(xml: &[u8]) -> Result<Vec<(String, String, String)>, XlsxError> {
    let mut entries = Vec::new();
    let mut reader = xml_reader(xml);
    let mut buf = Vec::with_capacity(64);
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"Relationship" => {
                let mut id = String::new();
                let mut target = String::new();
                let mut typ = String::new();
                for a in e.attributes() {
                    let a = a.map_err(XlsxError::XmlAttr)?;
                    match a.key {
                        QName(b"Id") => id = a.decode_and_unescape_value(reader.decoder())?.to_string(),
                        QName(b"Target") => {
                            target = a.decode_and_unescape_value(reader.decoder())?.to_string();
                        }
                        QName(b"Type") => typ = a.decode_and_unescape_value(reader.decoder())?.to_string(),
                        _ => (),
                    }
                }
                entries.push((id, target, typ));
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"Relationships" => break,
            Ok(Event::Eof) => return Err(XlsxError::XmlEof("Relationships")),
            Err(e) => return Err(XlsxError::Xml(e)),
            _ => (),
        }
    }
    Ok(entries)
}

/// A drawing anchor's cell rectangle, corners inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellRect {
    from_col: u32,
    from_row: u32,
    to_col: u32,
    to_row: u32,
}

/// Extracts `(r:embed id, rectangle)` pairs from the `twoCellAnchor`
/// and `oneCellAnchor` elements of a drawing part.
///
/// A grouped picture may embed several blips inside one anchor; each
/// yields its own pair. `oneCellAnchor` has no `to` block and reuses
/// the `from` corner.
fn drawing_anchors(xml: &[u8]) -> Result<Vec<(String, CellRect)>, XlsxError> {
    let mut out = Vec::new();
    let mut reader = xml_reader(xml);
    let mut buf = Vec::with_capacity(1024);

    let mut in_anchor = false;
    let mut two_cell = false;
    let mut embeds: Vec<String> = Vec::new();
    let mut in_from = false;
    let mut in_to = false;
    let mut cell_field: Option<&'static str> = None;
    let mut from = (0u32, 0u32);
    let mut to = (0u32, 0u32);

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                name @ (b"twoCellAnchor" | b"oneCellAnchor") if !in_anchor => {
                    in_anchor = true;
                    two_cell = matches!(name, b"twoCellAnchor");
                    embeds.clear();
                    from = (0, 0);
                    to = (0, 0);
                }
                b"from" if in_anchor => in_from = true,
                b"to" if in_anchor => in_to = true,
                b"col" if in_from || in_to => cell_field = Some("col"),
                b"row" if in_from || in_to => cell_field = Some("row"),
                b"blip" if in_anchor => {
                    for a in e.attributes() {
                        let a = a.map_err(XlsxError::XmlAttr)?;
                        let key = a.key.as_ref();
                        if key == b"embed" || key.ends_with(b":embed") {
                            embeds.push(a.decode_and_unescape_value(reader.decoder())?.to_string());
                        }
                    }
                }
                _ => (),
            },
            Ok(Event::Text(ref t)) => {
                if let Some(field) = cell_field {
                    let text = t.unescape()?;
                    let value: u32 = text.trim().parse()?;
                    let target = if in_from { &mut from } else { &mut to };
                    match field {
                        "col" => target.0 = value,
                        _ => target.1 = value,
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"twoCellAnchor" | b"oneCellAnchor" if in_anchor => {
                    let (to_col, to_row) = if two_cell { to } else { from };
                    let rect = CellRect {
                        from_col: from.0,
                        from_row: from.1,
                        to_col,
                        to_row,
                    };
                    for rid in embeds.drain(..) {
                        out.push((rid, rect));
                    }
                    in_anchor = false;
                }
                b"from" => in_from = false,
                b"to" => in_to = false,
                b"col" | b"row" => cell_field = None,
                _ => (),
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                // keep the anchors gathered so far
                warn!("malformed drawing xml: {e}");
                break;
            }
            _ => (),
        }
    }
    Ok(out)
}

/// Resolves a relationship target against an archive directory. A
/// leading `/` makes the target absolute within the archive; otherwise
/// `..` pops and `.` is a no-op.
fn resolve_path(base: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for part in target.split('/') {
        match part {
            ".." => {
                segments.pop();
            }
            "." | "" => {}
            _ => segments.push(part),
        }
    }
    segments.join("/")
}

/// `xl/drawings/drawing1.xml` -> `xl/drawings/_rels/drawing1.xml.rels`
fn rels_path(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => format!("{}/_rels/{}.rels", &path[..pos], &path[pos + 1..]),
        None => format!("_rels/{path}.rels"),
    }
}

fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Media MIME type from the entry's file extension.
fn mime_from_path(path: &str) -> ImageMime {
    let ext = path.rsplit('.').next().unwrap_or("");
    ImageMime::from_extension(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(
            resolve_path("xl/drawings", "../media/image1.png"),
            "xl/media/image1.png"
        );
        assert_eq!(
            resolve_path("xl/worksheets", "../drawings/drawing1.xml"),
            "xl/drawings/drawing1.xml"
        );
        assert_eq!(
            resolve_path("xl/drawings", "/xl/media/image1.png"),
            "xl/media/image1.png"
        );
        assert_eq!(
            resolve_path("xl/drawings", "./image1.png"),
            "xl/drawings/image1.png"
        );
        assert_eq!(resolve_path("xl", "worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(
            resolve_path("xl/a/b", "../../media/x.gif"),
            "xl/media/x.gif"
        );
    }

    #[test]
    fn test_rels_path() {
        assert_eq!(
            rels_path("xl/worksheets/sheet1.xml"),
            "xl/worksheets/_rels/sheet1.xml.rels"
        );
        assert_eq!(rels_path("workbook.xml"), "_rels/workbook.xml.rels");
    }

    #[test]
    fn test_mime_from_path() {
        assert_eq!(mime_from_path("xl/media/a.png"), ImageMime::Png);
        assert_eq!(mime_from_path("xl/media/a.JPG"), ImageMime::Jpeg);
        assert_eq!(mime_from_path("xl/media/a.jpeg"), ImageMime::Jpeg);
        assert_eq!(mime_from_path("xl/media/a.tif"), ImageMime::Tiff);
        assert_eq!(mime_from_path("xl/media/a.wmf"), ImageMime::Wmf);
        assert_eq!(mime_from_path("xl/media/a.dat"), ImageMime::Unknown);
    }

    #[test]
    fn test_drawing_anchors_two_cell() {
        let xml = br#"<xdr:wsDr xmlns:xdr="x" xmlns:a="y" xmlns:r="z">
          <xdr:twoCellAnchor editAs="oneCell">
            <xdr:from><xdr:col>1</xdr:col><xdr:colOff>9525</xdr:colOff><xdr:row>2</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from>
            <xdr:to><xdr:col>4</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>7</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to>
            <xdr:pic><xdr:blipFill><a:blip r:embed="rId1"/></xdr:blipFill></xdr:pic>
          </xdr:twoCellAnchor>
        </xdr:wsDr>"#;
        let anchors = drawing_anchors(xml).unwrap();
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].0, "rId1");
        assert_eq!(
            anchors[0].1,
            CellRect {
                from_col: 1,
                from_row: 2,
                to_col: 4,
                to_row: 7
            }
        );
    }

    #[test]
    fn test_drawing_anchors_one_cell_reuses_from() {
        let xml = br#"<wsDr>
          <oneCellAnchor>
            <from><col>3</col><colOff>0</colOff><row>5</row><rowOff>0</rowOff></from>
            <ext cx="100" cy="100"/>
            <pic><blipFill><blip embed="rId7"/></blipFill></pic>
          </oneCellAnchor>
        </wsDr>"#;
        let anchors = drawing_anchors(xml).unwrap();
        assert_eq!(anchors.len(), 1);
        assert_eq!(
            anchors[0].1,
            CellRect {
                from_col: 3,
                from_row: 5,
                to_col: 3,
                to_row: 5
            }
        );
    }

    #[test]
    fn test_drawing_anchors_grouped_blips() {
        let xml = br#"<wsDr>
          <twoCellAnchor>
            <from><col>0</col><row>0</row></from>
            <to><col>2</col><row>2</row></to>
            <grpSp>
              <pic><blipFill><blip r:embed="rId1"/></blipFill></pic>
              <pic><blipFill><blip r:embed="rId2"/></blipFill></pic>
            </grpSp>
          </twoCellAnchor>
        </wsDr>"#;
        let anchors = drawing_anchors(xml).unwrap();
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].0, "rId1");
        assert_eq!(anchors[1].0, "rId2");
        assert_eq!(anchors[0].1, anchors[1].1);
    }

    #[test]
    fn test_anchor_without_blip_is_ignored() {
        let xml = br#"<wsDr>
          <twoCellAnchor>
            <from><col>0</col><row>0</row></from>
            <to><col>1</col><row>1</row></to>
            <sp><txBody><t>just a shape</t></txBody></sp>
          </twoCellAnchor>
        </wsDr>"#;
        assert!(drawing_anchors(xml).unwrap().is_empty());
    }
}

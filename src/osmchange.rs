//! Streaming writer for OSMChange documents

use chrono;
use flate2::Compression;
use flate2::write::GzEncoder;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::writer::Writer;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror;

use crate::osm::{MemberSpelling, Node, OsmElement, Relation, Way};

/// Version attribute of the osmChange root element
pub const OSMCHANGE_VERSION: &str = "0.6";
/// Generator attribute of the osmChange root element
pub const OSMCHANGE_GENERATOR: &str = concat!("osm-changegen/", env!("CARGO_PKG_VERSION"));

macro_rules! printlnt {
    ($($arg:tt)*) => {
        println!("{} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), format_args!($($arg)*));
    };
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
}

/// Streaming writer for an OSMChange document
///
/// The root element is written on creation; batches of primitives are
/// streamed directly to the sink by [`add_create`](OsmChangeWriter::add_create),
/// [`add_modify`](OsmChangeWriter::add_modify) and
/// [`add_delete`](OsmChangeWriter::add_delete).
/// [`close`](OsmChangeWriter::close) must be called on the normal path;
/// dropping a writer holding data without closing it logs a warning and still
/// appends the root close tag so the document stays readable.
pub struct OsmChangeWriter {
    filename: String,
    xmlwriter: Writer<Box<dyn Write>>,
    spelling: MemberSpelling,
    data_written: bool,
    closed: bool,
}

impl OsmChangeWriter {
    /// Open `filename` (gzip-compressed if `compress`) and write the
    /// osmChange prologue.
    pub fn create(
        filename: &Path,
        compress: bool,
        spelling: MemberSpelling,
    ) -> Result<OsmChangeWriter, Error> {
        let fwriter = File::create(filename)?;
        let writer: Box<dyn Write> = if compress {
            let gzwriter = GzEncoder::new(fwriter, Compression::default());
            Box::new(BufWriter::new(gzwriter))
        } else {
            Box::new(BufWriter::new(fwriter))
        };
        let mut xmlwriter = Writer::new_with_indent(writer, b' ', 0);

        let mut elem = BytesStart::new("osmChange");
        elem.push_attribute(("version", OSMCHANGE_VERSION));
        elem.push_attribute(("generator", OSMCHANGE_GENERATOR));
        xmlwriter.write_event(Event::Start(elem))?;

        Ok(OsmChangeWriter {
            filename: filename.display().to_string(),
            xmlwriter,
            spelling,
            data_written: false,
            closed: false,
        })
    }

    /// Stream a `<create>` block containing all elements.
    pub fn add_create(&mut self, elements: &[OsmElement]) -> Result<(), Error> {
        self.add_block("create", elements)
    }
    /// Stream a `<modify>` block containing all elements.
    pub fn add_modify(&mut self, elements: &[OsmElement]) -> Result<(), Error> {
        self.add_block("modify", elements)
    }
    /// Stream a `<delete>` block containing all elements.
    pub fn add_delete(&mut self, elements: &[OsmElement]) -> Result<(), Error> {
        self.add_block("delete", elements)
    }

    /// Write the root close tag and flush the sink.
    pub fn close(&mut self) -> Result<(), Error> {
        self.xmlwriter
            .write_event(Event::End(BytesEnd::new("osmChange")))?;
        self.xmlwriter.get_mut().flush()?;
        self.closed = true;
        Ok(())
    }

    fn add_block(&mut self, action: &str, elements: &[OsmElement]) -> Result<(), Error> {
        self.xmlwriter
            .write_event(Event::Start(BytesStart::new(action)))?;
        for element in elements {
            match element {
                OsmElement::Node(node) => self.write_node(node)?,
                OsmElement::Way(way) => self.write_way(way)?,
                OsmElement::Relation(relation) => self.write_relation(relation)?,
            }
        }
        self.xmlwriter
            .write_event(Event::End(BytesEnd::new(action)))?;
        self.data_written = true;
        Ok(())
    }

    fn write_node(&mut self, node: &Node) -> Result<(), Error> {
        let elem = self
            .xmlwriter
            .create_element("node")
            .with_attribute(("id", node.id.to_string().as_str()))
            .with_attribute(("version", node.version.to_string().as_str()))
            .with_attribute(("lat", node.lat.to_string().as_str()))
            .with_attribute(("lon", node.lon.to_string().as_str()));

        if node.tags.is_empty() {
            elem.write_empty()?;
        } else {
            elem.write_inner_content(|writer| -> io::Result<()> {
                for tag in &node.tags {
                    writer
                        .create_element("tag")
                        .with_attribute(("k".as_bytes(), tag.key.as_bytes()))
                        .with_attribute(("v".as_bytes(), tag.value.as_bytes()))
                        .write_empty()?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn write_way(&mut self, way: &Way) -> Result<(), Error> {
        self.xmlwriter
            .create_element("way")
            .with_attribute(("id", way.id.to_string().as_str()))
            .with_attribute(("version", way.version.to_string().as_str()))
            .write_inner_content(|writer| -> io::Result<()> {
                for nd in &way.nds {
                    writer
                        .create_element("nd")
                        .with_attribute(("ref", nd.to_string().as_str()))
                        .write_empty()?;
                }
                for tag in &way.tags {
                    writer
                        .create_element("tag")
                        .with_attribute(("k".as_bytes(), tag.key.as_bytes()))
                        .with_attribute(("v".as_bytes(), tag.value.as_bytes()))
                        .write_empty()?;
                }
                Ok(())
            })?;
        Ok(())
    }

    fn write_relation(&mut self, relation: &Relation) -> Result<(), Error> {
        let spelling = self.spelling;
        self.xmlwriter
            .create_element("relation")
            .with_attribute(("id", relation.id.to_string().as_str()))
            .with_attribute(("version", relation.version.to_string().as_str()))
            .write_inner_content(|writer| -> io::Result<()> {
                for member in &relation.members {
                    writer
                        .create_element("member")
                        .with_attribute(("type", member.type_.as_str(spelling)))
                        .with_attribute(("ref", member.ref_.to_string().as_str()))
                        .with_attribute(("role".as_bytes(), member.role.as_bytes()))
                        .write_empty()?;
                }
                for tag in &relation.tags {
                    writer
                        .create_element("tag")
                        .with_attribute(("k".as_bytes(), tag.key.as_bytes()))
                        .with_attribute(("v".as_bytes(), tag.value.as_bytes()))
                        .write_empty()?;
                }
                Ok(())
            })?;
        Ok(())
    }
}

impl Drop for OsmChangeWriter {
    fn drop(&mut self) {
        if !self.closed {
            if self.data_written {
                printlnt!(
                    "Warning: {} dropped without close(), appending the root close tag",
                    self.filename
                );
            }
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::{Member, MemberType, Tag};
    use flate2::bufread::GzDecoder;
    use std::io::Read;

    fn test_node(id: i64) -> Node {
        Node {
            id,
            version: 1,
            lat: 47.6,
            lon: -122.33,
            tags: vec![Tag::new("natural", "peak")],
        }
    }

    #[test]
    fn create_block_with_node_and_way() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let mut writer =
            OsmChangeWriter::create(out.path(), false, MemberSpelling::Long).unwrap();
        let way = Way {
            id: -55,
            version: 1,
            nds: vec![-111, -112],
            tags: vec![Tag::new("highway", "path")],
        };
        writer
            .add_create(&[test_node(-111).into(), test_node(-112).into(), way.into()])
            .unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(out.path()).unwrap();
        assert!(content.starts_with("<osmChange version=\"0.6\""));
        assert!(content.contains("<create>"));
        assert!(content.contains("<node id=\"-111\" version=\"1\" lat=\"47.6\" lon=\"-122.33\">"));
        assert!(content.contains("<tag k=\"natural\" v=\"peak\"/>"));
        assert!(content.contains("<way id=\"-55\" version=\"1\">"));
        assert!(content.contains("<nd ref=\"-112\"/>"));
        assert!(content.trim_end().ends_with("</osmChange>"));
    }

    #[test]
    fn modify_and_delete_blocks() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let mut writer =
            OsmChangeWriter::create(out.path(), false, MemberSpelling::Long).unwrap();
        let way = Way {
            id: 4242,
            version: 2,
            nds: vec![1, 2, 3],
            tags: vec![],
        };
        writer.add_modify(&[way.into()]).unwrap();
        let gone = Way {
            id: 17,
            version: 99,
            nds: vec![],
            tags: vec![],
        };
        writer.add_delete(&[gone.into()]).unwrap();
        writer.close().unwrap();

        let content = std::fs::read_to_string(out.path()).unwrap();
        assert!(content.contains("<modify>"));
        assert!(content.contains("<way id=\"4242\" version=\"2\">"));
        assert!(content.contains("<delete>"));
        assert!(content.contains("<way id=\"17\" version=\"99\">"));
    }

    #[test]
    fn relation_member_spelling() {
        let member = Member {
            ref_: -55,
            type_: MemberType::Way,
            role: String::from("outer"),
        };
        let relation = Relation {
            id: -60,
            version: 1,
            members: vec![member],
            tags: vec![Tag::new("type", "multipolygon")],
        };

        let out = tempfile::NamedTempFile::new().unwrap();
        let mut writer =
            OsmChangeWriter::create(out.path(), false, MemberSpelling::Short).unwrap();
        writer.add_create(&[relation.clone().into()]).unwrap();
        writer.close().unwrap();
        let content = std::fs::read_to_string(out.path()).unwrap();
        assert!(content.contains("<member type=\"w\" ref=\"-55\" role=\"outer\"/>"));

        let out = tempfile::NamedTempFile::new().unwrap();
        let mut writer =
            OsmChangeWriter::create(out.path(), false, MemberSpelling::Long).unwrap();
        writer.add_create(&[relation.into()]).unwrap();
        writer.close().unwrap();
        let content = std::fs::read_to_string(out.path()).unwrap();
        assert!(content.contains("<member type=\"way\" ref=\"-55\" role=\"outer\"/>"));
    }

    #[test]
    fn dropped_writer_still_closes_the_root() {
        let out = tempfile::NamedTempFile::new().unwrap();
        {
            let mut writer =
                OsmChangeWriter::create(out.path(), false, MemberSpelling::Long).unwrap();
            writer.add_create(&[test_node(-1).into()]).unwrap();
            // no close(): the drop path terminates the document
        }
        let content = std::fs::read_to_string(out.path()).unwrap();
        assert!(content.trim_end().ends_with("</osmChange>"));
    }

    #[test]
    fn compressed_output() {
        let out = tempfile::NamedTempFile::new().unwrap();
        let mut writer =
            OsmChangeWriter::create(out.path(), true, MemberSpelling::Long).unwrap();
        writer.add_create(&[test_node(-1).into()]).unwrap();
        writer.close().unwrap();

        let raw = std::fs::read(out.path()).unwrap();
        let mut gzreader = GzDecoder::new(raw.as_slice());
        let mut content = String::new();
        gzreader.read_to_string(&mut content).unwrap();
        assert!(content.starts_with("<osmChange"));
        assert!(content.trim_end().ends_with("</osmChange>"));
    }
}

//! Basic handling of OpenStreetMap data

/// Number of fractional digits considered significant when comparing coordinates
pub const COORDINATE_PRECISION: u32 = 6;

#[allow(clippy::cast_possible_truncation)]
/// Convert a floating-point latitude/longitude to its rounded comparison key
pub fn coord_key(coord: f64) -> i64 {
    (coord * 10_f64.powi(COORDINATE_PRECISION as i32)).round() as i64
}

/// Tag
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
}
impl Tag {
    pub fn new(key: &str, value: &str) -> Tag {
        Tag {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    /// Node id
    pub id: i64,
    /// Version
    pub version: i32,
    /// Latitude in WGS84 degrees
    pub lat: f64,
    /// Longitude in WGS84 degrees
    pub lon: f64,
    /// Tags
    pub tags: Vec<Tag>,
}
impl Node {
    /// Returns the rounded-coordinate key used for node deduplication.
    pub fn coord_key(&self) -> (i64, i64) {
        (coord_key(self.lat), coord_key(self.lon))
    }
}

/// Way
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Way {
    /// Way id
    pub id: i64,
    /// Version
    pub version: i32,
    /// List of ordered node ids; a closed way repeats the first id at the end
    pub nds: Vec<i64>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Type of a primitive referenced by a relation member
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

/// Run-wide spelling of member types: `node`/`way`/`relation` or `n`/`w`/`r`
///
/// Ingestion from the OSM source and emission into the change file must use
/// the same value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MemberSpelling {
    #[default]
    Long,
    Short,
}

impl MemberType {
    /// Parse a member type, accepting both the long and the short spelling.
    pub fn parse(s: &str) -> Option<MemberType> {
        match s {
            "node" | "n" => Some(MemberType::Node),
            "way" | "w" => Some(MemberType::Way),
            "relation" | "r" => Some(MemberType::Relation),
            _ => None,
        }
    }
    pub fn as_str(self, spelling: MemberSpelling) -> &'static str {
        match (self, spelling) {
            (MemberType::Node, MemberSpelling::Long) => "node",
            (MemberType::Way, MemberSpelling::Long) => "way",
            (MemberType::Relation, MemberSpelling::Long) => "relation",
            (MemberType::Node, MemberSpelling::Short) => "n",
            (MemberType::Way, MemberSpelling::Short) => "w",
            (MemberType::Relation, MemberSpelling::Short) => "r",
        }
    }
}

/// Relation member
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    /// node/way/relation id
    pub ref_: i64,
    /// Type: node/way/relation
    pub type_: MemberType,
    /// Role in relation
    pub role: String,
}

/// Relation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Relation {
    /// Relation id
    pub id: i64,
    /// Version
    pub version: i32,
    /// List of ordered members
    pub members: Vec<Member>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Any OSM primitive carried through the change pipeline
#[derive(Clone, Debug, PartialEq)]
pub enum OsmElement {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

impl OsmElement {
    pub fn id(&self) -> i64 {
        match self {
            OsmElement::Node(n) => n.id,
            OsmElement::Way(w) => w.id,
            OsmElement::Relation(r) => r.id,
        }
    }
    pub fn tags(&self) -> &[Tag] {
        match self {
            OsmElement::Node(n) => &n.tags,
            OsmElement::Way(w) => &w.tags,
            OsmElement::Relation(r) => &r.tags,
        }
    }
    /// The member type a relation referencing this element would carry.
    pub fn member_type(&self) -> MemberType {
        match self {
            OsmElement::Node(_) => MemberType::Node,
            OsmElement::Way(_) => MemberType::Way,
            OsmElement::Relation(_) => MemberType::Relation,
        }
    }
}

impl From<Node> for OsmElement {
    fn from(node: Node) -> OsmElement {
        OsmElement::Node(node)
    }
}
impl From<Way> for OsmElement {
    fn from(way: Way) -> OsmElement {
        OsmElement::Way(way)
    }
}
impl From<Relation> for OsmElement {
    fn from(relation: Relation) -> OsmElement {
        OsmElement::Relation(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coord_key_rounding() {
        assert_eq!(coord_key(1.2345678), 1_234_568);
        assert_eq!(coord_key(-1.2345678), -1_234_568);
        assert_eq!(coord_key(47.6000004), coord_key(47.6));
        assert_ne!(coord_key(47.600001), coord_key(47.6));
    }

    #[test]
    fn member_type_spellings() {
        assert_eq!(MemberType::parse("way"), Some(MemberType::Way));
        assert_eq!(MemberType::parse("w"), Some(MemberType::Way));
        assert_eq!(MemberType::parse("street"), None);
        assert_eq!(MemberType::Relation.as_str(MemberSpelling::Short), "r");
        assert_eq!(MemberType::Node.as_str(MemberSpelling::Long), "node");
    }

    #[test]
    fn element_accessors() {
        let elem = OsmElement::from(Way {
            id: -4,
            version: 1,
            nds: vec![1, 2, 3],
            tags: vec![Tag::new("highway", "path")],
        });
        assert_eq!(elem.id(), -4);
        assert_eq!(elem.member_type(), MemberType::Way);
        assert_eq!(elem.tags()[0].key, "highway");
    }
}

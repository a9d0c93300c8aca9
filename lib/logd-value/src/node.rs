use logd_path::{KindedPath, Segment};
use ordered_float::NotNan;
use snafu::Snafu;

/// A key of an [`Object`] entry.
///
/// Sparse arrays are objects whose keys are all integers; the null key is
/// reserved for merge directives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Field(String),
    Index(u32),
    Null,
}

impl Key {
    pub fn field(name: impl Into<String>) -> Self {
        Key::Field(name.into())
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Field(name.to_string())
    }
}

impl From<u32> for Key {
    fn from(index: u32) -> Self {
        Key::Index(index)
    }
}

/// An ordered sequence of key→value pairs.
///
/// `sparse` distinguishes a sparse array (all keys integers) from a plain
/// object; it is recomputed whenever entries change shape.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Object {
    pub entries: Vec<(Key, Node)>,
    pub sparse: bool,
}

impl Object {
    pub fn new(entries: Vec<(Key, Node)>) -> Self {
        let sparse = !entries.is_empty()
            && entries.iter().all(|(key, _)| matches!(key, Key::Index(_)));
        Object { entries, sparse }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The value for `key`; the last occurrence wins when duplicated.
    pub fn get(&self, key: &Key) -> Option<&Node> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Node> {
        self.entries
            .iter_mut()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_field(&self, name: &str) -> Option<&Node> {
        self.get(&Key::Field(name.to_string()))
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Replaces the value at `key`, or appends a new entry.
    pub fn insert(&mut self, key: Key, value: Node) {
        match self.entries.iter_mut().rev().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key, value)),
        }
        self.recompute_sparse();
    }

    pub fn remove(&mut self, key: &Key) -> Option<Node> {
        let at = self.entries.iter().rposition(|(k, _)| k == key)?;
        let (_, value) = self.entries.remove(at);
        self.recompute_sparse();
        Some(value)
    }

    fn recompute_sparse(&mut self) {
        self.sparse = !self.entries.is_empty()
            && self
                .entries
                .iter()
                .all(|(key, _)| matches!(key, Key::Index(_)));
    }
}

/// The shape of a [`Node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Object(Object),
    Array(Vec<Node>),
    String(String),
    Int(i64),
    Float(NotNan<f64>),
    Bool(bool),
    Null,
}

/// A value in the document tree.
///
/// Every node may carry a tag (stored without the leading `!`) and comment
/// lines that attach to it. Parent links are not stored; navigation is
/// root-down via [`Node::get_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub kind: NodeKind,
    pub tag: Option<String>,
    pub comments: Vec<String>,
}

/// Error from [`Node::set_path`].
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum SetError {
    /// The path descends through a scalar.
    #[snafu(display("cannot descend into non-container at {path}"))]
    NotAContainer { path: KindedPath },

    /// An array index more than one past the end.
    #[snafu(display("array index out of range at {path}"))]
    IndexOutOfRange { path: KindedPath },

    /// Wildcards and key-by-value selectors do not address a single slot.
    #[snafu(display("segment at {path} does not address a single location"))]
    Unaddressable { path: KindedPath },
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Node {
            kind,
            tag: None,
            comments: Vec::new(),
        }
    }

    pub fn object(entries: Vec<(Key, Node)>) -> Self {
        Node::new(NodeKind::Object(Object::new(entries)))
    }

    pub fn empty_object() -> Self {
        Node::new(NodeKind::Object(Object::default()))
    }

    pub fn array(values: Vec<Node>) -> Self {
        Node::new(NodeKind::Array(values))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Node::new(NodeKind::String(value.into()))
    }

    pub fn int(value: i64) -> Self {
        Node::new(NodeKind::Int(value))
    }

    /// Panics if `value` is NaN; use [`NodeKind::Float`] directly with a
    /// checked [`NotNan`] otherwise.
    pub fn float(value: f64) -> Self {
        Node::new(NodeKind::Float(
            NotNan::new(value).expect("float node must not be NaN"),
        ))
    }

    pub fn bool(value: bool) -> Self {
        Node::new(NodeKind::Bool(value))
    }

    pub fn null() -> Self {
        Node::new(NodeKind::Null)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_comments(mut self, comments: Vec<String>) -> Self {
        self.comments = comments;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, NodeKind::Null)
    }

    pub fn as_object(&self) -> Option<&Object> {
        match &self.kind {
            NodeKind::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match &mut self.kind {
            NodeKind::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Node]> {
        match &self.kind {
            NodeKind::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            NodeKind::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            NodeKind::Bool(value) => Some(value),
            _ => None,
        }
    }

    /// Resolves one concrete segment against this node.
    ///
    /// Wildcards address sets of locations, not single children, and
    /// resolve to `None` here. Key-by-value selects the first child whose
    /// string value equals the literal.
    pub fn get(&self, segment: &Segment) -> Option<&Node> {
        match (segment, &self.kind) {
            (Segment::Field(name), NodeKind::Object(object)) => object.get_field(name),
            (Segment::Sparse(index), NodeKind::Object(object)) => {
                object.get(&Key::Index(*index))
            }
            (Segment::Index(index), NodeKind::Array(values)) => values.get(*index as usize),
            (Segment::KeyValue(literal), NodeKind::Object(object)) => object
                .entries
                .iter()
                .map(|(_, value)| value)
                .find(|value| value.as_str() == Some(literal)),
            (Segment::KeyValue(literal), NodeKind::Array(values)) => values
                .iter()
                .find(|value| value.as_str() == Some(literal)),
            _ => None,
        }
    }

    /// Resolves a concrete path; `None` when any step is absent.
    pub fn get_path(&self, path: &KindedPath) -> Option<&Node> {
        let mut current = self;
        for segment in path.segments() {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Sets the value at `path`, creating intermediate containers.
    ///
    /// Field segments materialize plain objects, sparse segments sparse
    /// objects; an array index exactly one past the end appends. The root
    /// path replaces this node wholesale.
    pub fn set_path(&mut self, path: &KindedPath, value: Node) -> Result<(), SetError> {
        let mut current = self;
        let mut walked = KindedPath::root();
        let mut segments = path.segments().iter().peekable();

        while let Some(segment) = segments.next() {
            walked.push(segment.clone());
            let last = segments.peek().is_none();
            let node = current;

            match segment {
                Segment::Field(_) | Segment::Sparse(_) => {
                    let key = match segment {
                        Segment::Field(name) => Key::Field(name.clone()),
                        Segment::Sparse(index) => Key::Index(*index),
                        _ => unreachable!(),
                    };
                    if node.is_null() {
                        node.kind = NodeKind::Object(Object::default());
                    }
                    let object = match &mut node.kind {
                        NodeKind::Object(object) => object,
                        _ => return Err(SetError::NotAContainer { path: walked }),
                    };
                    if last {
                        object.insert(key, value);
                        return Ok(());
                    }
                    if !object.contains(&key) {
                        object.insert(key.clone(), Node::null());
                    }
                    current = object.get_mut(&key).expect("key inserted above");
                }
                Segment::Index(index) => {
                    if node.is_null() {
                        node.kind = NodeKind::Array(Vec::new());
                    }
                    let values = match &mut node.kind {
                        NodeKind::Array(values) => values,
                        _ => return Err(SetError::NotAContainer { path: walked }),
                    };
                    let at = *index as usize;
                    if at > values.len() {
                        return Err(SetError::IndexOutOfRange { path: walked });
                    }
                    if at == values.len() {
                        values.push(Node::null());
                    }
                    if last {
                        values[at] = value;
                        return Ok(());
                    }
                    current = &mut values[at];
                }
                Segment::FieldWild
                | Segment::IndexWild
                | Segment::SparseWild
                | Segment::KeyValue(_) => {
                    return Err(SetError::Unaddressable { path: walked });
                }
            }
        }

        // Root path: replace wholesale.
        *current = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> KindedPath {
        KindedPath::parse(s).unwrap()
    }

    #[test]
    fn get_path_navigates_objects_arrays_and_sparse() {
        let doc = Node::object(vec![
            (
                Key::from("users"),
                Node::object(vec![(
                    Key::Index(3002),
                    Node::object(vec![(Key::from("name"), Node::string("ada"))]),
                )]),
            ),
            (
                Key::from("list"),
                Node::array(vec![Node::int(1), Node::int(2)]),
            ),
        ]);

        assert_eq!(
            doc.get_path(&path("users{3002}.name")).unwrap(),
            &Node::string("ada")
        );
        assert_eq!(doc.get_path(&path("list[1]")).unwrap(), &Node::int(2));
        assert!(doc.get_path(&path("users{1}")).is_none());
        assert!(doc.get_path(&path("list[2]")).is_none());
        assert!(doc.get_path(&path("users.*")).is_none());
    }

    #[test]
    fn key_by_value_selects_matching_child() {
        let doc = Node::array(vec![
            Node::string("alpha"),
            Node::string("beta"),
        ]);
        assert_eq!(
            doc.get(&Segment::KeyValue("beta".into())).unwrap(),
            &Node::string("beta")
        );
        assert!(doc.get(&Segment::KeyValue("gamma".into())).is_none());
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut doc = Node::empty_object();
        doc.set_path(&path("a.b{7}"), Node::int(42)).unwrap();
        assert_eq!(doc.get_path(&path("a.b{7}")).unwrap(), &Node::int(42));
        let b = doc.get_path(&path("a.b")).unwrap();
        assert!(b.as_object().unwrap().sparse);
    }

    #[test]
    fn set_path_appends_at_array_end_only() {
        let mut doc = Node::object(vec![(Key::from("xs"), Node::array(vec![Node::int(0)]))]);
        doc.set_path(&path("xs[1]"), Node::int(1)).unwrap();
        assert_eq!(doc.get_path(&path("xs[1]")).unwrap(), &Node::int(1));
        assert!(matches!(
            doc.set_path(&path("xs[9]"), Node::int(9)),
            Err(SetError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn sparse_flag_tracks_entry_shape() {
        let mut object = Object::new(vec![(Key::Index(5), Node::int(1))]);
        assert!(object.sparse);
        object.insert(Key::from("name"), Node::null());
        assert!(!object.sparse);
        object.remove(&Key::from("name"));
        assert!(object.sparse);
    }
}

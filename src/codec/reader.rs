//! Inbound value deserialization.
//!
//! Readers are thin views over a parsed XML tree. The demultiplexer
//! parses each frame body once; continuations and subscribers then walk
//! the tree through [`ArrayReader`], [`StructReader`] and
//! [`ValueReader`] without copying text until a scalar is actually
//! extracted.
//!
//! All shape violations surface as [`RpcError::Structure`] so a single
//! malformed response never panics the transport.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use roxmltree::Node;

use crate::error::{Result, RpcError};

fn find_child<'a>(node: Node<'a, 'a>, tag: &str) -> Option<Node<'a, 'a>> {
    node.children().find(|c| c.has_tag_name(tag))
}

fn structure(msg: impl Into<String>) -> RpcError {
    RpcError::Structure(msg.into())
}

/// View over one `<value>` element.
#[derive(Clone, Copy)]
pub struct ValueReader<'a> {
    node: Node<'a, 'a>,
}

impl<'a> ValueReader<'a> {
    pub(crate) fn new(node: Node<'a, 'a>) -> Self {
        Self { node }
    }

    /// Inner typed element, or the `<value>` node itself when the
    /// content is an untyped (implicit string) value.
    fn typed(&self) -> Option<Node<'a, 'a>> {
        self.node.children().find(|c| c.is_element())
    }

    fn text(node: Node<'a, 'a>) -> &'a str {
        node.text().unwrap_or("")
    }

    /// Read an `int` (the server also emits the `i4` alias).
    pub fn as_int(&self) -> Result<i32> {
        let typed = self
            .typed()
            .ok_or_else(|| structure("expected <int>, found bare value"))?;
        if !typed.has_tag_name("int") && !typed.has_tag_name("i4") {
            return Err(structure(format!(
                "expected <int>, found <{}>",
                typed.tag_name().name()
            )));
        }
        Self::text(typed)
            .trim()
            .parse()
            .map_err(|_| structure("unparsable <int> content"))
    }

    /// Read a `string`. An untyped `<value>text</value>` defaults to
    /// string per the grammar.
    pub fn as_str(&self) -> Result<&'a str> {
        match self.typed() {
            None => Ok(Self::text(self.node)),
            Some(typed) if typed.has_tag_name("string") => Ok(Self::text(typed)),
            Some(typed) => Err(structure(format!(
                "expected <string>, found <{}>",
                typed.tag_name().name()
            ))),
        }
    }

    /// Read a `boolean` (`0`/`1`, with `true`/`false` tolerated).
    pub fn as_bool(&self) -> Result<bool> {
        let typed = self
            .typed()
            .ok_or_else(|| structure("expected <boolean>, found bare value"))?;
        if !typed.has_tag_name("boolean") {
            return Err(structure(format!(
                "expected <boolean>, found <{}>",
                typed.tag_name().name()
            )));
        }
        match Self::text(typed).trim() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(structure(format!("unparsable <boolean> content: {other:?}"))),
        }
    }

    /// Read and decode a `base64` payload.
    pub fn as_base64(&self) -> Result<Vec<u8>> {
        let typed = self
            .typed()
            .ok_or_else(|| structure("expected <base64>, found bare value"))?;
        if !typed.has_tag_name("base64") {
            return Err(structure(format!(
                "expected <base64>, found <{}>",
                typed.tag_name().name()
            )));
        }
        BASE64
            .decode(Self::text(typed).trim())
            .map_err(|e| structure(format!("invalid base64 content: {e}")))
    }

    /// Read a nested `array`.
    pub fn as_array(&self) -> Result<ArrayReader<'a>> {
        let typed = self
            .typed()
            .ok_or_else(|| structure("expected <array>, found bare value"))?;
        if !typed.has_tag_name("array") {
            return Err(structure(format!(
                "expected <array>, found <{}>",
                typed.tag_name().name()
            )));
        }
        ArrayReader::from_array(typed)
    }

    /// Read a nested `struct`.
    pub fn as_struct(&self) -> Result<StructReader<'a>> {
        let typed = self
            .typed()
            .ok_or_else(|| structure("expected <struct>, found bare value"))?;
        if !typed.has_tag_name("struct") {
            return Err(structure(format!(
                "expected <struct>, found <{}>",
                typed.tag_name().name()
            )));
        }
        Ok(StructReader { node: typed })
    }
}

/// View over an ordered sequence of values: either an `<array>`'s
/// `<data>` children or a `<params>` list of `<param>` elements.
#[derive(Clone, Copy)]
pub struct ArrayReader<'a> {
    container: Node<'a, 'a>,
    params_form: bool,
}

impl<'a> ArrayReader<'a> {
    /// View the elements of an `<array>` node.
    pub(crate) fn from_array(array: Node<'a, 'a>) -> Result<Self> {
        let data =
            find_child(array, "data").ok_or_else(|| structure("<array> without <data>"))?;
        Ok(Self {
            container: data,
            params_form: false,
        })
    }

    /// View the values of a `<params>` node, one per `<param>`.
    pub(crate) fn from_params(params: Node<'a, 'a>) -> Self {
        Self {
            container: params,
            params_form: true,
        }
    }

    fn values(&self) -> impl Iterator<Item = Node<'a, 'a>> + '_ {
        let params_form = self.params_form;
        self.container
            .children()
            .filter(|c| c.is_element())
            .filter_map(move |c| {
                if params_form {
                    if c.has_tag_name("param") {
                        find_child(c, "value")
                    } else {
                        None
                    }
                } else if c.has_tag_name("value") {
                    Some(c)
                } else {
                    None
                }
            })
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values().count()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.values().next().is_none()
    }

    /// Value at `index`, or a structure error when out of range.
    pub fn get(&self, index: usize) -> Result<ValueReader<'a>> {
        self.try_get(index)
            .ok_or_else(|| structure(format!("missing value at index {index}")))
    }

    /// Value at `index`, or `None` when out of range.
    pub fn try_get(&self, index: usize) -> Option<ValueReader<'a>> {
        self.values().nth(index).map(ValueReader::new)
    }

    /// Iterate over all values in order.
    pub fn iter(&self) -> impl Iterator<Item = ValueReader<'a>> + '_ {
        self.values().map(ValueReader::new)
    }
}

/// View over the members of a `<struct>`.
#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    node: Node<'a, 'a>,
}

impl<'a> StructReader<'a> {
    /// Value of the member called `name`, or a structure error when absent.
    pub fn member(&self, name: &str) -> Result<ValueReader<'a>> {
        self.try_member(name)
            .ok_or_else(|| structure(format!("missing struct member {name:?}")))
    }

    /// Value of the member called `name`, or `None` when absent.
    pub fn try_member(&self, name: &str) -> Option<ValueReader<'a>> {
        self.node
            .children()
            .filter(|c| c.has_tag_name("member"))
            .find(|m| {
                find_child(*m, "name")
                    .and_then(|n| n.text())
                    .map(|t| t == name)
                    .unwrap_or(false)
            })
            .and_then(|m| find_child(m, "value"))
            .map(ValueReader::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roxmltree::Document;

    fn first_value<'a>(doc: &'a Document<'a>) -> ValueReader<'a> {
        ValueReader::new(doc.root_element())
    }

    #[test]
    fn test_read_int_and_i4() {
        let doc = Document::parse("<value><int>42</int></value>").unwrap();
        assert_eq!(first_value(&doc).as_int().unwrap(), 42);

        let doc = Document::parse("<value><i4>-7</i4></value>").unwrap();
        assert_eq!(first_value(&doc).as_int().unwrap(), -7);
    }

    #[test]
    fn test_read_string_typed_and_untyped() {
        let doc = Document::parse("<value><string>hi &amp; bye</string></value>").unwrap();
        assert_eq!(first_value(&doc).as_str().unwrap(), "hi & bye");

        // Untyped content defaults to string.
        let doc = Document::parse("<value>plain</value>").unwrap();
        assert_eq!(first_value(&doc).as_str().unwrap(), "plain");
    }

    #[test]
    fn test_empty_string() {
        let doc = Document::parse("<value><string></string></value>").unwrap();
        assert_eq!(first_value(&doc).as_str().unwrap(), "");
    }

    #[test]
    fn test_read_bool() {
        let doc = Document::parse("<value><boolean>1</boolean></value>").unwrap();
        assert!(first_value(&doc).as_bool().unwrap());

        let doc = Document::parse("<value><boolean>0</boolean></value>").unwrap();
        assert!(!first_value(&doc).as_bool().unwrap());

        let doc = Document::parse("<value><boolean>true</boolean></value>").unwrap();
        assert!(first_value(&doc).as_bool().unwrap());

        let doc = Document::parse("<value><boolean>2</boolean></value>").unwrap();
        assert!(first_value(&doc).as_bool().is_err());
    }

    #[test]
    fn test_read_base64() {
        let doc = Document::parse("<value><base64>aGVsbG8=</base64></value>").unwrap();
        assert_eq!(first_value(&doc).as_base64().unwrap(), b"hello");
    }

    #[test]
    fn test_type_mismatch_is_structure_error() {
        let doc = Document::parse("<value><string>x</string></value>").unwrap();
        let err = first_value(&doc).as_int().unwrap_err();
        assert!(matches!(err, RpcError::Structure(_)));
        assert!(err.to_string().contains("<string>"));
    }

    #[test]
    fn test_read_array() {
        let doc = Document::parse(
            "<value><array><data>\
             <value><int>1</int></value>\
             <value><string>two</string></value>\
             </data></array></value>",
        )
        .unwrap();
        let array = first_value(&doc).as_array().unwrap();

        assert_eq!(array.len(), 2);
        assert!(!array.is_empty());
        assert_eq!(array.get(0).unwrap().as_int().unwrap(), 1);
        assert_eq!(array.get(1).unwrap().as_str().unwrap(), "two");
        assert!(array.try_get(2).is_none());
        assert!(matches!(array.get(2), Err(RpcError::Structure(_))));
    }

    #[test]
    fn test_array_without_data_is_malformed() {
        let doc = Document::parse("<value><array></array></value>").unwrap();
        assert!(first_value(&doc).as_array().is_err());
    }

    #[test]
    fn test_read_struct() {
        let doc = Document::parse(
            "<value><struct>\
             <member><name>Code</name><value><int>7</int></value></member>\
             <member><name>Name</name><value><string>x</string></value></member>\
             </struct></value>",
        )
        .unwrap();
        let s = first_value(&doc).as_struct().unwrap();

        assert_eq!(s.member("Code").unwrap().as_int().unwrap(), 7);
        assert_eq!(s.member("Name").unwrap().as_str().unwrap(), "x");
        assert!(s.try_member("Missing").is_none());
        assert!(matches!(s.member("Missing"), Err(RpcError::Structure(_))));
    }

    #[test]
    fn test_params_form() {
        let doc = Document::parse(
            "<params>\
             <param><value><int>5</int></value></param>\
             <param><value><boolean>1</boolean></value></param>\
             </params>",
        )
        .unwrap();
        let params = ArrayReader::from_params(doc.root_element());

        assert_eq!(params.len(), 2);
        assert_eq!(params.get(0).unwrap().as_int().unwrap(), 5);
        assert!(params.get(1).unwrap().as_bool().unwrap());
    }

    #[test]
    fn test_iter_order() {
        let doc = Document::parse(
            "<value><array><data>\
             <value><int>1</int></value>\
             <value><int>2</int></value>\
             <value><int>3</int></value>\
             </data></array></value>",
        )
        .unwrap();
        let array = first_value(&doc).as_array().unwrap();
        let ints: Vec<i32> = array.iter().map(|v| v.as_int().unwrap()).collect();
        assert_eq!(ints, vec![1, 2, 3]);
    }
}

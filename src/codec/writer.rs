//! Outbound call serialization.
//!
//! A [`CallWriter`] builds the serialized form of one call. Two forms
//! exist, selected at construction:
//!
//! - **Member form** ([`CallWriter::new`]): the shape embedded inside a
//!   multicall struct element: a `methodName` member followed by a
//!   `params` member holding the argument array. This is what the engine
//!   queues and batches.
//! - **Document form** ([`CallWriter::document`]): a standalone
//!   `methodCall` document with each argument wrapped in `<param>`.
//!
//! Value kinds match the server grammar exactly: `int`, `string`
//! (XML-entity escaped), `boolean` (`0`/`1`), `base64` (standard
//! alphabet), nested `array` and `struct`. Nested writers borrow the
//! underlying buffer and emit their closing tags on drop, so malformed
//! nesting cannot be expressed.
//!
//! Encoding is a pure function of the written values: building the same
//! call twice yields byte-identical output.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::RpcError;

/// XML document prologue, byte-exact for server compatibility.
pub(crate) const XML_PROLOGUE: &str = r#"<?xml version="1.0" encoding="utf-8" ?>"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    Member,
    Document,
}

/// Serializer for one call's method name and argument list.
pub struct CallWriter {
    buf: String,
    form: Form,
}

impl CallWriter {
    /// Start a call in member form (the batchable shape).
    pub fn new(method: &str) -> Self {
        Self::with_buffer(String::new(), method)
    }

    /// Start a call in member form, reusing a checked-out buffer.
    pub(crate) fn with_buffer(mut buf: String, method: &str) -> Self {
        buf.push_str("<member><name>methodName</name><value><string>");
        escape_into(&mut buf, method);
        buf.push_str("</string></value></member><member><name>params</name><value><array><data>");
        Self {
            buf,
            form: Form::Member,
        }
    }

    /// Start a standalone `methodCall` document.
    pub fn document(method: &str) -> Self {
        let mut buf = String::with_capacity(128);
        buf.push_str(XML_PROLOGUE);
        buf.push_str("<methodCall><methodName>");
        escape_into(&mut buf, method);
        buf.push_str("</methodName><params>");
        Self {
            buf,
            form: Form::Document,
        }
    }

    fn begin_param(&mut self) {
        if self.form == Form::Document {
            self.buf.push_str("<param>");
        }
    }

    fn end_param(&mut self) {
        if self.form == Form::Document {
            self.buf.push_str("</param>");
        }
    }

    /// Append an `int` argument.
    pub fn write_int(&mut self, value: i32) {
        self.begin_param();
        write_int_value(&mut self.buf, value);
        self.end_param();
    }

    /// Append a `string` argument (XML-entity escaped).
    pub fn write_string(&mut self, value: &str) {
        self.begin_param();
        write_string_value(&mut self.buf, value);
        self.end_param();
    }

    /// Append a `boolean` argument, encoded as `0`/`1`.
    pub fn write_bool(&mut self, value: bool) {
        self.begin_param();
        write_bool_value(&mut self.buf, value);
        self.end_param();
    }

    /// Append a `base64` argument over raw bytes.
    pub fn write_base64(&mut self, value: &[u8]) {
        self.begin_param();
        write_base64_value(&mut self.buf, value);
        self.end_param();
    }

    /// Open a nested array argument. The array is closed when the
    /// returned writer is dropped.
    pub fn begin_array(&mut self) -> ArrayWriter<'_> {
        let close_param = self.form == Form::Document;
        self.begin_param();
        ArrayWriter::open(&mut self.buf, close_param)
    }

    /// Open a nested struct argument. The struct is closed when the
    /// returned writer is dropped.
    pub fn begin_struct(&mut self) -> StructWriter<'_> {
        let close_param = self.form == Form::Document;
        self.begin_param();
        StructWriter::open(&mut self.buf, close_param)
    }

    /// Finish a member-form call and take its serialized body.
    ///
    /// Fails for document-form writers; those cannot be batched.
    pub(crate) fn into_member_body(mut self) -> Result<String, RpcError> {
        if self.form != Form::Member {
            return Err(RpcError::Usage(
                "a document-form writer cannot be queued into a batch",
            ));
        }
        self.buf.push_str("</data></array></value></member>");
        Ok(self.buf)
    }

    /// Finish a document-form call and take the complete document.
    pub fn into_document(mut self) -> Result<String, RpcError> {
        if self.form != Form::Document {
            return Err(RpcError::Usage(
                "a member-form writer does not produce a standalone document",
            ));
        }
        self.buf.push_str("</params></methodCall>");
        Ok(self.buf)
    }
}

/// Writer for the elements of a nested `array`.
///
/// Closing tags are emitted on drop.
pub struct ArrayWriter<'a> {
    buf: &'a mut String,
    close_param: bool,
}

impl<'a> ArrayWriter<'a> {
    fn open(buf: &'a mut String, close_param: bool) -> Self {
        buf.push_str("<value><array><data>");
        Self { buf, close_param }
    }

    /// Append an `int` element.
    pub fn add_int(&mut self, value: i32) {
        write_int_value(self.buf, value);
    }

    /// Append a `string` element.
    pub fn add_string(&mut self, value: &str) {
        write_string_value(self.buf, value);
    }

    /// Append a `boolean` element.
    pub fn add_bool(&mut self, value: bool) {
        write_bool_value(self.buf, value);
    }

    /// Append a `base64` element.
    pub fn add_base64(&mut self, value: &[u8]) {
        write_base64_value(self.buf, value);
    }

    /// Open a struct element inside this array.
    pub fn begin_struct(&mut self) -> StructWriter<'_> {
        StructWriter::open(self.buf, false)
    }
}

impl Drop for ArrayWriter<'_> {
    fn drop(&mut self) {
        self.buf.push_str("</data></array></value>");
        if self.close_param {
            self.buf.push_str("</param>");
        }
    }
}

/// Writer for the members of a nested `struct`.
///
/// Closing tags are emitted on drop.
pub struct StructWriter<'a> {
    buf: &'a mut String,
    close_param: bool,
}

impl<'a> StructWriter<'a> {
    fn open(buf: &'a mut String, close_param: bool) -> Self {
        buf.push_str("<value><struct>");
        Self { buf, close_param }
    }

    fn member(&mut self, name: &str, write_value: impl FnOnce(&mut String)) {
        self.buf.push_str("<member><name>");
        escape_into(self.buf, name);
        self.buf.push_str("</name>");
        write_value(self.buf);
        self.buf.push_str("</member>");
    }

    /// Append an `int` member.
    pub fn write_int(&mut self, name: &str, value: i32) {
        self.member(name, |buf| write_int_value(buf, value));
    }

    /// Append a `string` member.
    pub fn write_string(&mut self, name: &str, value: &str) {
        self.member(name, |buf| write_string_value(buf, value));
    }

    /// Append a `boolean` member.
    pub fn write_bool(&mut self, name: &str, value: bool) {
        self.member(name, |buf| write_bool_value(buf, value));
    }

    /// Append a `base64` member.
    pub fn write_base64(&mut self, name: &str, value: &[u8]) {
        self.member(name, |buf| write_base64_value(buf, value));
    }

    /// Open an array-valued member.
    pub fn begin_array(&mut self, name: &str) -> MemberArrayWriter<'_> {
        MemberArrayWriter::open(self.buf, name)
    }
}

impl Drop for StructWriter<'_> {
    fn drop(&mut self) {
        self.buf.push_str("</struct></value>");
        if self.close_param {
            self.buf.push_str("</param>");
        }
    }
}

/// Writer for an array nested under a struct member.
pub struct MemberArrayWriter<'a> {
    buf: &'a mut String,
}

impl<'a> MemberArrayWriter<'a> {
    fn open(buf: &'a mut String, name: &str) -> Self {
        buf.push_str("<member><name>");
        escape_into(buf, name);
        buf.push_str("</name><value><array><data>");
        Self { buf }
    }

    /// Append an `int` element.
    pub fn add_int(&mut self, value: i32) {
        write_int_value(self.buf, value);
    }

    /// Append a `string` element.
    pub fn add_string(&mut self, value: &str) {
        write_string_value(self.buf, value);
    }

    /// Append a `boolean` element.
    pub fn add_bool(&mut self, value: bool) {
        write_bool_value(self.buf, value);
    }

    /// Append a `base64` element.
    pub fn add_base64(&mut self, value: &[u8]) {
        write_base64_value(self.buf, value);
    }
}

impl Drop for MemberArrayWriter<'_> {
    fn drop(&mut self) {
        self.buf.push_str("</data></array></value></member>");
    }
}

fn write_int_value(buf: &mut String, value: i32) {
    buf.push_str("<value><int>");
    let _ = write!(buf, "{value}");
    buf.push_str("</int></value>");
}

fn write_string_value(buf: &mut String, value: &str) {
    buf.push_str("<value><string>");
    escape_into(buf, value);
    buf.push_str("</string></value>");
}

fn write_bool_value(buf: &mut String, value: bool) {
    buf.push_str("<value><boolean>");
    buf.push(if value { '1' } else { '0' });
    buf.push_str("</boolean></value>");
}

fn write_base64_value(buf: &mut String, value: &[u8]) {
    buf.push_str("<value><base64>");
    BASE64.encode_string(value, buf);
    buf.push_str("</base64></value>");
}

/// Escape text for embedding in XML content or attribute position.
pub(crate) fn escape_into(buf: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&#39;"),
            _ => buf.push(ch),
        }
    }
}

//! Multicall envelope assembly.
//!
//! A batch of member-form call bodies is wrapped into one
//! `system.multicall` document: a single outer array whose elements are
//! one struct per call, each struct carrying `methodName` and `params`
//! members. The per-call bodies are produced by
//! [`CallWriter::new`](super::CallWriter::new) and already contain those
//! two members, so the envelope only adds the struct and array framing.

use crate::protocol::MULTICALL_METHOD;

use super::writer::XML_PROLOGUE;

/// Assemble a multicall document from pre-serialized member-form bodies.
///
/// Writes into `out` so the envelope buffer can come from the pool.
pub(crate) fn encode_multicall_into(out: &mut String, bodies: &[String]) {
    out.push_str(XML_PROLOGUE);
    out.push_str("<methodCall><methodName>");
    out.push_str(MULTICALL_METHOD);
    out.push_str("</methodName><params><param><value><array><data>");
    for body in bodies {
        out.push_str("<value><struct>");
        out.push_str(body);
        out.push_str("</struct></value>");
    }
    out.push_str("</data></array></value></param></params></methodCall>");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CallWriter;

    fn body(method: &str, arg: &str) -> String {
        let mut w = CallWriter::new(method);
        w.write_string(arg);
        w.into_member_body().unwrap()
    }

    #[test]
    fn test_envelope_shape() {
        let mut out = String::new();
        encode_multicall_into(&mut out, &[body("GetVersion", "a")]);

        assert!(out.starts_with(XML_PROLOGUE));
        assert!(out.contains(concat!(
            "<methodCall><methodName>system.multicall</methodName>",
            "<params><param><value><array><data><value><struct>",
        )));
        assert!(out.ends_with("</struct></value></data></array></value></param></params></methodCall>"));
    }

    #[test]
    fn test_one_struct_per_call_in_order() {
        let mut out = String::new();
        encode_multicall_into(&mut out, &[body("First", "1"), body("Second", "2")]);

        let first = out.find("<value><string>First</string></value>").unwrap();
        let second = out.find("<value><string>Second</string></value>").unwrap();
        assert!(first < second);
        assert_eq!(out.matches("<value><struct>").count(), 2);
    }

    #[test]
    fn test_empty_batch_still_well_formed() {
        let mut out = String::new();
        encode_multicall_into(&mut out, &[]);
        assert!(out.contains("<data></data>"));
        roxmltree::Document::parse(&out).unwrap();
    }

    #[test]
    fn test_envelope_parses_back() {
        let mut out = String::new();
        encode_multicall_into(&mut out, &[body("ChatSendServerMessage", "hi <all>")]);

        let doc = roxmltree::Document::parse(&out).unwrap();
        assert_eq!(doc.root_element().tag_name().name(), "methodCall");
    }
}

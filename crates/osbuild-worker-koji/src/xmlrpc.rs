//! Minimal XML-RPC codec covering what the Koji hub speaks.
//!
//! Supports `int`/`i4`/`i8`, `boolean`, `string`, `double`,
//! `dateTime.iso8601` (kept as text), `base64`, `struct`, `array` and the
//! `nil` extension.

use std::collections::BTreeMap;
use std::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;

use crate::error::DecodeSnafu;
use crate::error::Error;
use crate::error::FaultSnafu;
use crate::error::Result;
use crate::error::XmlSnafu;

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    String(String),
    Double(f64),
    DateTime(String),
    Base64(Vec<u8>),
    Struct(BTreeMap<String, Value>),
    Array(Vec<Value>),
    Nil,
}

impl Value {
    /// Build a struct from `(key, value)` pairs.
    pub fn structure<I, K>(members: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Struct(members.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    /// Struct member, or a decode error naming `what`.
    pub fn member(&self, key: &str, what: &str) -> Result<&Value> {
        self.as_struct().and_then(|m| m.get(key)).ok_or_else(|| {
            DecodeSnafu {
                what,
                reason: format!("missing member '{key}'"),
            }
            .build()
        })
    }

    /// Integer struct member.
    pub fn int_member(&self, key: &str, what: &str) -> Result<i64> {
        self.member(key, what)?.as_i64().ok_or_else(|| {
            DecodeSnafu {
                what,
                reason: format!("member '{key}' is not an integer"),
            }
            .build()
        })
    }

    /// String struct member.
    pub fn str_member(&self, key: &str, what: &str) -> Result<String> {
        self.member(key, what)?.as_str().map(str::to_string).ok_or_else(|| {
            DecodeSnafu {
                what,
                reason: format!("member '{key}' is not a string"),
            }
            .build()
        })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Encode a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Encode a successful `methodResponse` document.
pub fn encode_response(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><params><param>");
    encode_value(&mut out, value);
    out.push_str("</param></params></methodResponse>");
    out
}

/// Encode a fault `methodResponse` document.
pub fn encode_fault(code: i64, message: &str) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><fault>");
    encode_value(
        &mut out,
        &Value::structure([("faultCode", Value::Int(code)), ("faultString", Value::from(message))]),
    );
    out.push_str("</fault></methodResponse>");
    out
}

fn encode_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(i) if i32::try_from(*i).is_ok() => {
            let _ = write!(out, "<int>{i}</int>");
        }
        Value::Int(i) => {
            let _ = write!(out, "<i8>{i}</i8>");
        }
        Value::Bool(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
        }
        Value::String(s) => {
            let _ = write!(out, "<string>{}</string>", escape(s.as_str()));
        }
        Value::Double(d) => {
            let _ = write!(out, "<double>{d}</double>");
        }
        Value::DateTime(s) => {
            let _ = write!(out, "<dateTime.iso8601>{}</dateTime.iso8601>", escape(s.as_str()));
        }
        Value::Base64(bytes) => {
            let _ = write!(out, "<base64>{}</base64>", STANDARD.encode(bytes));
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                let _ = write!(out, "<member><name>{}</name>", escape(name.as_str()));
                encode_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>");
}

/// Element tree used while decoding.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn require(&self, name: &str) -> Result<&Node> {
        self.child(name).ok_or_else(|| {
            XmlSnafu {
                reason: format!("<{}> has no <{name}>", self.name),
            }
            .build()
        })
    }
}

fn xml_error(err: impl std::fmt::Display) -> Error {
    XmlSnafu { reason: err.to_string() }.build()
}

fn parse_tree(xml: &str) -> Result<Node> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = vec![Node::default()];

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => stack.push(Node {
                name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                ..Node::default()
            }),
            Event::Empty(empty) => {
                let node = Node {
                    name: String::from_utf8_lossy(empty.name().as_ref()).into_owned(),
                    ..Node::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| xml_error("unbalanced end tag"))?;
                let parent = stack.last_mut().ok_or_else(|| xml_error("unbalanced end tag"))?;
                parent.children.push(node);
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(xml_error)?;
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return XmlSnafu {
            reason: "unexpected end of document",
        }
        .fail();
    }
    let mut root = stack.pop().unwrap_or_default();
    root.children.pop().ok_or_else(|| xml_error("empty document"))
}

fn parse_value(node: &Node) -> Result<Value> {
    let Some(typed) = node.children.first() else {
        return Ok(Value::String(node.text.clone()));
    };

    let text = typed.text.trim();
    let value = match typed.name.as_str() {
        "int" | "i4" | "i8" => Value::Int(text.parse().map_err(xml_error)?),
        "boolean" => Value::Bool(match text {
            "1" | "true" => true,
            "0" | "false" => false,
            other => return XmlSnafu { reason: format!("invalid boolean '{other}'") }.fail(),
        }),
        "string" => Value::String(typed.text.clone()),
        "double" => Value::Double(text.parse().map_err(xml_error)?),
        "dateTime.iso8601" => Value::DateTime(text.to_string()),
        "base64" => {
            let compact: String = text.split_whitespace().collect();
            Value::Base64(STANDARD.decode(compact).map_err(xml_error)?)
        }
        "nil" => Value::Nil,
        "struct" => {
            let mut members = BTreeMap::new();
            for member in typed.children.iter().filter(|c| c.name == "member") {
                let name = member.require("name")?.text.clone();
                let value = parse_value(member.require("value")?)?;
                members.insert(name, value);
            }
            Value::Struct(members)
        }
        "array" => {
            let data = typed.require("data")?;
            let items = data
                .children
                .iter()
                .filter(|c| c.name == "value")
                .map(parse_value)
                .collect::<Result<Vec<_>>>()?;
            Value::Array(items)
        }
        other => return XmlSnafu { reason: format!("unsupported type <{other}>") }.fail(),
    };
    Ok(value)
}

/// Decode a `methodResponse`. Faults become [`Error::Fault`].
pub fn decode_response(xml: &str) -> Result<Value> {
    let root = parse_tree(xml)?;
    if root.name != "methodResponse" {
        return XmlSnafu {
            reason: format!("expected <methodResponse>, found <{}>", root.name),
        }
        .fail();
    }

    if let Some(fault) = root.child("fault") {
        let value = parse_value(fault.require("value")?)?;
        let code = value.int_member("faultCode", "fault")?;
        let message = value.str_member("faultString", "fault")?;
        return FaultSnafu { code, message }.fail();
    }

    let params = root.require("params")?;
    match params.child("param") {
        Some(param) => parse_value(param.require("value")?),
        None => Ok(Value::Nil),
    }
}

/// Decode a `methodCall` into its method name and parameters.
pub fn decode_call(xml: &str) -> Result<(String, Vec<Value>)> {
    let root = parse_tree(xml)?;
    if root.name != "methodCall" {
        return XmlSnafu {
            reason: format!("expected <methodCall>, found <{}>", root.name),
        }
        .fail();
    }

    let method = root.require("methodName")?.text.trim().to_string();
    let params = match root.child("params") {
        Some(params) => params
            .children
            .iter()
            .filter(|c| c.name == "param")
            .map(|p| p.require("value").and_then(parse_value))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok((method, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_encodes_structs_and_arrays() {
        let build = Value::structure([
            ("name", Value::from("fedora-guest")),
            ("version", Value::from("40")),
            ("release", Value::from("1")),
        ]);
        let xml = encode_call("CGInitBuild", &[Value::from("osbuild"), build.clone()]);
        assert!(xml.contains("<methodName>CGInitBuild</methodName>"));

        let (method, params) = decode_call(&xml).unwrap();
        assert_eq!(method, "CGInitBuild");
        assert_eq!(params, vec![Value::from("osbuild"), build]);
    }

    #[test]
    fn test_large_ints_use_i8() {
        let xml = encode_call("x", &[Value::Int(1 << 40)]);
        assert!(xml.contains("<i8>1099511627776</i8>"));
        let (_, params) = decode_call(&xml).unwrap();
        assert_eq!(params[0], Value::Int(1 << 40));
    }

    #[test]
    fn test_text_is_escaped() {
        let xml = encode_call("x", &[Value::from("a<b & c>")]);
        assert!(xml.contains("a&lt;b &amp; c&gt;"));
        let (_, params) = decode_call(&xml).unwrap();
        assert_eq!(params[0], Value::from("a<b & c>"));
    }

    #[test]
    fn test_decode_response_with_whitespace() {
        let xml = r#"<?xml version='1.0'?>
<methodResponse>
  <params>
    <param>
      <value><struct>
        <member><name>session-id</name><value><int>42</int></value></member>
        <member><name>session-key</name><value><string>abc-def</string></value></member>
        <member><name>untyped</name><value>plain</value></member>
        <member><name>list</name><value><array><data>
          <value><boolean>1</boolean></value>
          <value><nil/></value>
        </data></array></value></member>
      </struct></value>
    </param>
  </params>
</methodResponse>"#;
        let value = decode_response(xml).unwrap();
        assert_eq!(value.int_member("session-id", "login").unwrap(), 42);
        assert_eq!(value.str_member("session-key", "login").unwrap(), "abc-def");
        assert_eq!(value.str_member("untyped", "login").unwrap(), "plain");
        assert_eq!(
            value.member("list", "login").unwrap(),
            &Value::Array(vec![Value::Bool(true), Value::Nil])
        );
    }

    #[test]
    fn test_fault_is_an_error() {
        let xml = encode_fault(1000, "build 7 is not in BUILDING state");
        match decode_response(&xml).unwrap_err() {
            Error::Fault { code, message } => {
                assert_eq!(code, 1000);
                assert_eq!(message, "build 7 is not in BUILDING state");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_params_is_nil() {
        let xml = "<methodResponse><params></params></methodResponse>";
        assert_eq!(decode_response(xml).unwrap(), Value::Nil);
    }

    #[test]
    fn test_response_roundtrip_base64() {
        let xml = encode_response(&Value::Base64(b"chunk".to_vec()));
        assert_eq!(decode_response(&xml).unwrap(), Value::Base64(b"chunk".to_vec()));
    }

    #[test]
    fn test_truncated_document() {
        assert!(decode_response("<methodResponse><params>").is_err());
    }
}

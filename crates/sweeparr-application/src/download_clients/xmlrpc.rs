// SPDX-License-Identifier: GPL-3.0-or-later
//! Minimal XML-RPC encoding and decoding for the rTorrent adapter.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlRpcError {
    #[error("malformed xml-rpc document: {0}")]
    Parse(String),
    #[error("xml-rpc fault {code}: {message}")]
    Fault { code: i64, message: String },
    #[error("unexpected xml-rpc value: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    String(String),
    Double(f64),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
    Nil,
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::String(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Struct(members) => members
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    xml.push_str(&escape(method));
    xml.push_str("</methodName><params>");
    for param in params {
        xml.push_str("<param>");
        encode_value(param, &mut xml);
        xml.push_str("</param>");
    }
    xml.push_str("</params></methodCall>");
    xml
}

fn encode_value(value: &Value, xml: &mut String) {
    xml.push_str("<value>");
    match value {
        Value::Int(v) if i32::try_from(*v).is_ok() => xml.push_str(&format!("<i4>{v}</i4>")),
        Value::Int(v) => xml.push_str(&format!("<i8>{v}</i8>")),
        Value::Bool(v) => xml.push_str(&format!("<boolean>{}</boolean>", u8::from(*v))),
        Value::String(v) => {
            xml.push_str("<string>");
            xml.push_str(&escape(v.as_str()));
            xml.push_str("</string>");
        }
        Value::Double(v) => xml.push_str(&format!("<double>{v}</double>")),
        Value::Array(values) => {
            xml.push_str("<array><data>");
            for value in values {
                encode_value(value, xml);
            }
            xml.push_str("</data></array>");
        }
        Value::Struct(members) => {
            xml.push_str("<struct>");
            for (name, value) in members {
                xml.push_str("<member><name>");
                xml.push_str(&escape(name.as_str()));
                xml.push_str("</name>");
                encode_value(value, xml);
                xml.push_str("</member>");
            }
            xml.push_str("</struct>");
        }
        Value::Nil => xml.push_str("<nil/>"),
    }
    xml.push_str("</value>");
}

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn named(name: &[u8]) -> Self {
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Self::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }
}

fn parse_tree(xml: &str) -> Result<Node, XmlRpcError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Node::named(b"#document")];
    loop {
        let event = reader
            .read_event()
            .map_err(|err| XmlRpcError::Parse(err.to_string()))?;
        match event {
            Event::Start(start) => stack.push(Node::named(start.name().as_ref())),
            Event::Empty(empty) => {
                let node = Node::named(empty.name().as_ref());
                current(&mut stack)?.children.push(node);
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|err| XmlRpcError::Parse(err.to_string()))?;
                current(&mut stack)?.text.push_str(&text);
            }
            Event::CData(data) => {
                let data = data.into_inner();
                current(&mut stack)?
                    .text
                    .push_str(&String::from_utf8_lossy(&data));
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| XmlRpcError::Parse("unbalanced end tag".to_string()))?;
                current(&mut stack)?.children.push(node);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(XmlRpcError::Parse("unclosed element".to_string()));
    }
    stack
        .pop()
        .ok_or_else(|| XmlRpcError::Parse("empty document".to_string()))
}

fn current(stack: &mut [Node]) -> Result<&mut Node, XmlRpcError> {
    stack
        .last_mut()
        .ok_or_else(|| XmlRpcError::Parse("unbalanced end tag".to_string()))
}

fn decode_value(node: &Node) -> Result<Value, XmlRpcError> {
    let Some(typed) = node.children.first() else {
        return Ok(Value::String(node.text.clone()));
    };

    let text = typed.text.trim();
    match typed.name.as_str() {
        "i4" | "i8" | "int" => text
            .parse()
            .map(Value::Int)
            .map_err(|_| XmlRpcError::Unexpected(format!("integer '{text}'"))),
        "boolean" => Ok(Value::Bool(text == "1")),
        "double" => text
            .parse()
            .map(Value::Double)
            .map_err(|_| XmlRpcError::Unexpected(format!("double '{text}'"))),
        "string" | "base64" | "dateTime.iso8601" => Ok(Value::String(typed.text.clone())),
        "nil" => Ok(Value::Nil),
        "array" => {
            let Some(data) = typed.child("data") else {
                return Ok(Value::Array(Vec::new()));
            };
            data.children
                .iter()
                .filter(|child| child.name == "value")
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        "struct" => typed
            .children
            .iter()
            .filter(|child| child.name == "member")
            .map(|member| {
                let name = member
                    .child("name")
                    .map(|name| name.text.clone())
                    .unwrap_or_default();
                let value = match member.child("value") {
                    Some(value) => decode_value(value)?,
                    None => Value::Nil,
                };
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, XmlRpcError>>()
            .map(Value::Struct),
        other => Err(XmlRpcError::Unexpected(format!("element <{other}>"))),
    }
}

/// Decode a `methodResponse`, turning a fault into an error.
pub fn parse_response(xml: &str) -> Result<Value, XmlRpcError> {
    let document = parse_tree(xml)?;
    let response = document
        .child("methodResponse")
        .ok_or_else(|| XmlRpcError::Parse("missing methodResponse".to_string()))?;

    if let Some(fault) = response.child("fault") {
        let value = fault
            .child("value")
            .map(decode_value)
            .transpose()?
            .unwrap_or(Value::Nil);
        return Err(XmlRpcError::Fault {
            code: value
                .member("faultCode")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            message: value
                .member("faultString")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let value = response
        .child("params")
        .and_then(|params| params.child("param"))
        .and_then(|param| param.child("value"))
        .ok_or_else(|| XmlRpcError::Parse("response without a value".to_string()))?;
    decode_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_call_with_escaped_strings() {
        let xml = encode_call(
            "d.custom1.set",
            &[Value::from("ABC"), Value::from("tv & <movies>"), Value::Int(5_000_000_000)],
        );
        assert!(xml.contains("<methodName>d.custom1.set</methodName>"));
        assert!(xml.contains("<string>tv &amp; &lt;movies&gt;</string>"));
        assert!(xml.contains("<i8>5000000000</i8>"));
    }

    #[test]
    fn decodes_nested_arrays() {
        let xml = r#"<?xml version="1.0"?>
            <methodResponse><params><param><value><array><data>
              <value><array><data>
                <value><string>ABC</string></value>
                <value><i8>1024</i8></value>
                <value>plain</value>
                <value><string/></value>
              </data></array></value>
            </data></array></value></param></params></methodResponse>"#;

        let value = parse_response(xml).expect("parses");
        let rows = value.as_array().expect("outer array");
        let row = rows[0].as_array().expect("inner array");
        assert_eq!(row[0].as_str(), Some("ABC"));
        assert_eq!(row[1].as_i64(), Some(1024));
        assert_eq!(row[2].as_str(), Some("plain"));
        assert_eq!(row[3].as_str(), Some(""));
    }

    #[test]
    fn fault_becomes_error() {
        let xml = r#"<?xml version="1.0"?>
            <methodResponse><fault><value><struct>
              <member><name>faultCode</name><value><i4>-501</i4></value></member>
              <member><name>faultString</name><value><string>Could not find info-hash.</string></value></member>
            </struct></value></fault></methodResponse>"#;

        match parse_response(xml) {
            Err(XmlRpcError::Fault { code, message }) => {
                assert_eq!(code, -501);
                assert_eq!(message, "Could not find info-hash.");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_documents() {
        assert!(parse_response("<methodResponse><params>").is_err());
    }
}

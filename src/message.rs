//! # Message Module
//!
//! The unified message model carried across every driver: a subject, a
//! kind, a set of named typed fields, an immutable per-message config of
//! transport hints, and a meta-map of driver-local annotations that never
//! reaches the bus.
//!
//! Messages round-trip exactly through two canonical text forms:
//!
//! ```text
//! <MESSAGE SUBJECT="A.B.C" KIND="PUBLISH">
//!     <FIELD NAME="X" TYPE="I32">42</FIELD>
//! </MESSAGE>
//! ```
//!
//! ```text
//! {"MESSAGE":{"SUBJECT":"A.B.C","KIND":"PUBLISH",
//!             "FIELD":[{"NAME":"X","TYPE":"I32","VALUE":"42"}]}}
//! ```
//!
//! and through a compact binary form (`to_bytes`/`from_bytes`) used for
//! wire framing and aggregation-bin payloads.

use crate::config::Config;
use crate::field::{coerce, Field, FieldType, FieldValue};
use crate::status::{Result, Status, StatusCode};
use crate::subject::validate_subject;
use crate::template::MessageTemplate;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Role of a message on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Publish,
    Request,
    Reply,
}

impl Kind {
    pub fn tag(&self) -> &'static str {
        match self {
            Kind::Publish => "PUBLISH",
            Kind::Request => "REQUEST",
            Kind::Reply => "REPLY",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag.to_uppercase().as_str() {
            "PUBLISH" => Ok(Kind::Publish),
            "REQUEST" => Ok(Kind::Request),
            "REPLY" => Ok(Kind::Reply),
            other => Err(Status::msg_error(
                StatusCode::UnknownMsgType,
                format!("Unknown message kind: {other}"),
            )),
        }
    }

    /// Deduce the kind from a MESSAGE-TYPE field value.
    pub fn from_message_type(value: &str) -> Result<Self> {
        match value.to_uppercase().as_str() {
            "MSG" => Ok(Kind::Publish),
            "REQ" => Ok(Kind::Request),
            "RESP" => Ok(Kind::Reply),
            other => Err(Status::msg_error(
                StatusCode::UnknownMsgType,
                format!("Unknown MESSAGE-TYPE: {other}"),
            )),
        }
    }
}

/// A self-describing, typed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    subject: String,
    kind: Kind,
    fields: BTreeMap<String, Field>,
    #[serde(skip)]
    config: Config,
    #[serde(skip)]
    meta: BTreeMap<String, FieldValue>,
    #[serde(skip)]
    template: Option<Arc<MessageTemplate>>,
}

impl Message {
    pub fn new(subject: &str, kind: Kind) -> Result<Self> {
        validate_subject(subject)?;
        Ok(Self {
            subject: subject.to_string(),
            kind,
            fields: BTreeMap::new(),
            config: Config::default(),
            meta: BTreeMap::new(),
            template: None,
        })
    }

    /// Build a message from its XML or JSON text form, auto-detected by
    /// the first non-blank byte.
    pub fn from_data(data: &str) -> Result<Self> {
        match data.trim_start().chars().next() {
            Some('<') => Self::from_xml(data),
            Some('{') => Self::from_json(data),
            _ => Err(Status::msg_error(
                StatusCode::BadMsgFormat,
                "Message data is neither XML nor JSON",
            )),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn set_subject(&mut self, subject: &str) -> Result<()> {
        validate_subject(subject)?;
        self.subject = subject.to_string();
        Ok(())
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: Kind) {
        self.kind = kind;
    }

    /// Transport hints for this message. Never serialized to the bus.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Merge transport hints into the message config (overwriting).
    pub fn set_config(&mut self, config: &Config) {
        self.config.merge(config, true);
    }

    /// Add a field, replacing any field of the same name. Returns `true`
    /// when an existing field was replaced.
    pub fn add_field(&mut self, field: Field) -> bool {
        self.fields.insert(field.name().to_string(), field).is_some()
    }

    /// Convenience: build and add a field from a name and value.
    pub fn add_field_value(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<bool> {
        Ok(self.add_field(Field::new(name, value)?))
    }

    /// Set a field by name, coercing the textual value against the
    /// attached template's declared type. Without a template the value is
    /// stored as a STRING field.
    pub fn set_field_value(&mut self, name: &str, value: &str) -> Result<bool> {
        let target = self
            .template
            .as_ref()
            .and_then(|t| t.field(name))
            .map(|ft| ft.field_type());

        let coerced = match target {
            Some(ty) => coerce(ty, &FieldValue::String(value.to_string()), true)?,
            None => FieldValue::String(value.to_string()),
        };
        Ok(self.add_field(Field::new(name, coerced)?))
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Text view of a field's value, if present.
    pub fn string_value(&self, name: &str) -> Option<String> {
        self.fields.get(name).map(|f| f.string_value())
    }

    pub fn clear_field(&mut self, name: &str) -> bool {
        self.fields.remove(name).is_some()
    }

    pub fn clear_fields(&mut self) {
        self.fields.clear();
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Iterate the fields in canonical (name) order.
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    /// Copy every field of `self` into `dest` (replacing same-named
    /// fields there).
    pub fn copy_fields(&self, dest: &mut Message) {
        for field in self.fields.values() {
            dest.add_field(field.clone());
        }
    }

    /// Approximate serialized size in bytes.
    pub fn size(&self) -> usize {
        let fields: usize = self
            .fields
            .values()
            .map(|f| f.name().len() + f.value().size() + 2)
            .sum();
        self.subject.len() + 1 + fields
    }

    /// Check the message against its attached template, if any.
    pub fn is_compliant(&self) -> Status {
        match &self.template {
            Some(template) => match template.check(self) {
                Ok(()) => Status::default(),
                Err(status) => status,
            },
            None => Status::default(),
        }
    }

    pub(crate) fn set_template(&mut self, template: Arc<MessageTemplate>) {
        self.template = Some(template);
    }

    pub(crate) fn template(&self) -> Option<&Arc<MessageTemplate>> {
        self.template.as_ref()
    }

    // Meta-map: opaque driver-local annotations, never serialized.

    pub(crate) fn set_meta(&mut self, name: &str, value: FieldValue) {
        self.meta.insert(name.to_string(), value);
    }

    pub(crate) fn meta(&self, name: &str) -> Option<&FieldValue> {
        self.meta.get(name)
    }

    pub(crate) fn meta_string(&self, name: &str) -> Option<String> {
        self.meta.get(name).map(|v| v.render())
    }

    pub(crate) fn clear_meta(&mut self, name: &str) -> bool {
        self.meta.remove(name).is_some()
    }

    /// Compact binary form used for wire framing and bin payloads. The
    /// config and meta-map do not travel.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            Status::msg_error(StatusCode::BadMsgFormat, format!("Encode failed: {e}"))
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            Status::msg_error(StatusCode::BadMsgFormat, format!("Decode failed: {e}"))
        })
    }

    // ---- canonical XML form ----

    pub fn to_xml(&self) -> String {
        let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b'\t', 1);

        let mut root = BytesStart::new("MESSAGE");
        root.push_attribute(("SUBJECT", self.subject.as_str()));
        root.push_attribute(("KIND", self.kind.tag()));
        // The writer only fails on a failing io::Write; Vec cannot fail.
        let _ = writer.write_event(Event::Start(root));

        for field in self.fields.values() {
            let mut elem = BytesStart::new("FIELD");
            elem.push_attribute(("NAME", field.name()));
            elem.push_attribute(("TYPE", field.field_type().tag()));
            if field.is_header() {
                elem.push_attribute(("HEAD", "T"));
            }
            let _ = writer.write_event(Event::Start(elem));
            let _ = writer.write_event(Event::Text(BytesText::new(&field.string_value())));
            let _ = writer.write_event(Event::End(BytesEnd::new("FIELD")));
        }

        let _ = writer.write_event(Event::End(BytesEnd::new("MESSAGE")));
        String::from_utf8(writer.into_inner()).unwrap_or_default()
    }

    pub fn from_xml(data: &str) -> Result<Self> {
        let bad = |detail: String| Status::msg_error(StatusCode::BadMsgFormat, detail);

        let mut reader = quick_xml::Reader::from_str(data);
        let mut message: Option<Message> = None;
        // Set when the KIND attribute was absent and must be deduced
        // from a MESSAGE-TYPE field once all fields are parsed.
        let mut deduce_kind = false;

        // Per-FIELD parse state.
        let mut field_attrs: Option<(String, FieldType, bool)> = None;
        let mut field_text = String::new();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| bad(format!("Malformed XML: {e}")))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let self_closing = matches!(event, Event::Empty(_));
                    match e.name().as_ref() {
                        b"MESSAGE" => {
                            let mut subject = None;
                            let mut kind = None;
                            for attr in e.attributes().flatten() {
                                let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                                let value = attr
                                    .unescape_value()
                                    .map_err(|e| bad(format!("Bad XML attribute: {e}")))?
                                    .to_string();
                                match key.as_str() {
                                    "SUBJECT" => subject = Some(value),
                                    "KIND" | "TYPE" => kind = Some(Kind::from_tag(&value)?),
                                    _ => {}
                                }
                            }
                            let subject =
                                subject.ok_or_else(|| bad("MESSAGE is missing SUBJECT".into()))?;
                            let kind = match kind {
                                Some(kind) => kind,
                                None => {
                                    deduce_kind = true;
                                    Kind::Publish
                                }
                            };
                            message = Some(Message::new(&subject, kind)?);
                        }
                        b"FIELD" => {
                            let mut name = None;
                            let mut ty = None;
                            let mut header = false;
                            for attr in e.attributes().flatten() {
                                let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                                let value = attr
                                    .unescape_value()
                                    .map_err(|e| bad(format!("Bad XML attribute: {e}")))?
                                    .to_string();
                                match key.as_str() {
                                    "NAME" => name = Some(value),
                                    "TYPE" => ty = Some(FieldType::from_tag(&value)?),
                                    "HEAD" => header = value.eq_ignore_ascii_case("T"),
                                    _ => {}
                                }
                            }
                            let name = name.ok_or_else(|| bad("FIELD is missing NAME".into()))?;
                            let ty = ty.ok_or_else(|| bad("FIELD is missing TYPE".into()))?;
                            if self_closing {
                                // <FIELD .../> carries an empty value.
                                let value = FieldValue::parse(ty, "")?;
                                let field = Field::new(&name, value)?.with_header(header);
                                message
                                    .as_mut()
                                    .ok_or_else(|| bad("FIELD outside MESSAGE".into()))?
                                    .add_field(field);
                            } else {
                                field_attrs = Some((name, ty, header));
                                field_text.clear();
                            }
                        }
                        other => {
                            let tag = String::from_utf8_lossy(other).to_string();
                            return Err(bad(format!("Unexpected element <{tag}>")));
                        }
                    }
                }
                Event::Text(t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| bad(format!("Bad XML text: {e}")))?;
                    field_text.push_str(text.trim());
                }
                Event::End(e) => {
                    if e.name().as_ref() == b"FIELD" {
                        let (name, ty, header) = field_attrs
                            .take()
                            .ok_or_else(|| bad("Stray </FIELD>".into()))?;
                        let value = FieldValue::parse(ty, &field_text)?;
                        let field = Field::new(&name, value)?.with_header(header);
                        message
                            .as_mut()
                            .ok_or_else(|| bad("FIELD outside MESSAGE".into()))?
                            .add_field(field);
                        field_text.clear();
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let mut message = message.ok_or_else(|| bad("No MESSAGE element found".into()))?;
        if deduce_kind {
            match message.string_value("MESSAGE-TYPE") {
                Some(value) => message.set_kind(Kind::from_message_type(&value)?),
                None => return Err(bad("MESSAGE is missing KIND".into())),
            }
        }
        Ok(message)
    }

    // ---- canonical JSON form ----

    pub fn to_json(&self) -> String {
        let fields: Vec<serde_json::Value> = self
            .fields
            .values()
            .map(|field| {
                let mut entry = serde_json::json!({
                    "NAME": field.name(),
                    "TYPE": field.field_type().tag(),
                    "VALUE": field.string_value(),
                });
                if field.is_header() {
                    entry["HEAD"] = serde_json::Value::String("T".into());
                }
                entry
            })
            .collect();

        serde_json::json!({
            "MESSAGE": {
                "SUBJECT": self.subject,
                "KIND": self.kind.tag(),
                "FIELD": fields,
            }
        })
        .to_string()
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let bad = |detail: String| Status::msg_error(StatusCode::BadMsgFormat, detail);

        let root: serde_json::Value =
            serde_json::from_str(data).map_err(|e| bad(format!("Malformed JSON: {e}")))?;
        let body = root
            .get("MESSAGE")
            .ok_or_else(|| bad("JSON is missing MESSAGE".into()))?;

        let subject = body
            .get("SUBJECT")
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad("MESSAGE is missing SUBJECT".into()))?;

        let kind = match body.get("KIND").and_then(|v| v.as_str()) {
            Some(tag) => Kind::from_tag(tag)?,
            // Fall back to deducing from a MESSAGE-TYPE field.
            None => {
                let fields = body.get("FIELD").and_then(|v| v.as_array());
                let msg_type = fields
                    .and_then(|fs| {
                        fs.iter().find(|f| {
                            f.get("NAME").and_then(|n| n.as_str()) == Some("MESSAGE-TYPE")
                        })
                    })
                    .and_then(|f| f.get("VALUE"))
                    .and_then(|v| v.as_str());
                match msg_type {
                    Some(value) => Kind::from_message_type(value)?,
                    None => return Err(bad("MESSAGE is missing KIND".into())),
                }
            }
        };

        let mut message = Message::new(subject, kind)?;

        if let Some(fields) = body.get("FIELD").and_then(|v| v.as_array()) {
            for entry in fields {
                let name = entry
                    .get("NAME")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| bad("FIELD is missing NAME".into()))?;
                let ty = entry
                    .get("TYPE")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| bad("FIELD is missing TYPE".into()))?;
                let ty = FieldType::from_tag(ty)?;
                let value = match entry.get("VALUE") {
                    Some(serde_json::Value::String(s)) => FieldValue::parse(ty, s)?,
                    Some(serde_json::Value::Number(n)) => {
                        FieldValue::parse(ty, &n.to_string())?
                    }
                    Some(serde_json::Value::Bool(b)) => {
                        FieldValue::parse(ty, if *b { "true" } else { "false" })?
                    }
                    _ => return Err(bad(format!("FIELD {name} is missing VALUE"))),
                };
                let header = entry.get("HEAD").and_then(|v| v.as_str()) == Some("T");
                message.add_field(Field::new(name, value)?.with_header(header));
            }
        }

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut msg = Message::new("A.B.C", Kind::Publish).unwrap();
        msg.add_field_value("X", 42i32).unwrap();
        msg.add_field_value("NAME", "orbiter").unwrap();
        msg.add_field_value("RATIO", 2.5f64).unwrap();
        msg.add_field_value("RAW", vec![0xDEu8, 0xAD]).unwrap();
        msg.add_field(Field::new("FLAG", true).unwrap().with_header(true));
        msg
    }

    #[test]
    fn duplicate_field_replaces_and_reports() {
        let mut msg = Message::new("A.B", Kind::Publish).unwrap();
        assert!(!msg.add_field_value("N", 1i32).unwrap());
        assert!(msg.add_field_value("N", 2i32).unwrap());
        assert_eq!(msg.field_count(), 1);
        assert_eq!(msg.get_field("N").unwrap().i64_value().unwrap(), 2);
    }

    #[test]
    fn empty_subject_is_rejected() {
        assert!(Message::new("", Kind::Publish).is_err());
        let mut msg = Message::new("A.B", Kind::Publish).unwrap();
        assert!(msg.set_subject("").is_err());
    }

    #[test]
    fn xml_round_trip_is_exact() {
        let msg = sample();
        let xml = msg.to_xml();
        let back = Message::from_xml(&xml).unwrap();
        assert_eq!(back.subject(), msg.subject());
        assert_eq!(back.kind(), msg.kind());
        assert_eq!(back.field_count(), msg.field_count());
        assert_eq!(back.to_xml(), xml);
        // Header flag survives.
        assert!(back.get_field("FLAG").unwrap().is_header());
        assert_eq!(
            back.get_field("RAW").unwrap().value(),
            &FieldValue::Binary(vec![0xDE, 0xAD])
        );
    }

    #[test]
    fn json_round_trip_is_exact() {
        let msg = sample();
        let json = msg.to_json();
        let back = Message::from_json(&json).unwrap();
        assert_eq!(back.to_json(), json);
        assert_eq!(
            back.get_field("RATIO").unwrap().value(),
            &FieldValue::F64(2.5)
        );
    }

    #[test]
    fn from_data_detects_the_format() {
        let msg = sample();
        assert!(Message::from_data(&msg.to_xml()).is_ok());
        assert!(Message::from_data(&msg.to_json()).is_ok());
        assert!(Message::from_data("neither").is_err());
    }

    #[test]
    fn kind_deduced_from_message_type_field() {
        let json = r#"{"MESSAGE":{"SUBJECT":"A.B","FIELD":[
            {"NAME":"MESSAGE-TYPE","TYPE":"STRING","VALUE":"REQ"}]}}"#;
        let msg = Message::from_json(json).unwrap();
        assert_eq!(msg.kind(), Kind::Request);
    }

    #[test]
    fn wire_bytes_do_not_carry_meta_or_config() {
        let mut msg = sample();
        msg.set_meta("GMSEC-REPLY-UNIQUE-ID", FieldValue::String("abc".into()));
        let mut hints = Config::new();
        hints.add_value("mw-priority", "7").unwrap();
        msg.set_config(&hints);

        let back = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert!(back.meta("GMSEC-REPLY-UNIQUE-ID").is_none());
        assert!(back.config().is_empty());
        assert_eq!(back.field_count(), msg.field_count());
    }

    #[test]
    fn copy_fields_replaces_in_destination() {
        let src = sample();
        let mut dest = Message::new("D.E", Kind::Publish).unwrap();
        dest.add_field_value("X", 0i32).unwrap();
        src.copy_fields(&mut dest);
        assert_eq!(dest.get_field("X").unwrap().i64_value().unwrap(), 42);
        assert_eq!(dest.field_count(), src.field_count());
    }

    #[test]
    fn size_grows_with_content() {
        let mut msg = Message::new("A.B", Kind::Publish).unwrap();
        let empty = msg.size();
        msg.add_field_value("PAYLOAD", vec![0u8; 128]).unwrap();
        assert!(msg.size() >= empty + 128);
    }
}

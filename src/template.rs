//! Message templates and the specification collaborator.
//!
//! The full schema engine (loading template files for an entire message
//! standard) lives outside this crate; the core only depends on the
//! contract modeled here: a [`Specification`] selected by configuration
//! that can look up a [`MessageTemplate`] for a message, reject a
//! non-compliant message, and dictate target types for text-value
//! coercion.

use crate::config::{keys, Config};
use crate::field::{coerce, FieldType};
use crate::message::Message;
use crate::status::{Result, Status, StatusClass, StatusCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub const SPEC_2014: u32 = 201400;
pub const SPEC_2016: u32 = 201600;
pub const SPEC_2018: u32 = 201800;
pub const SPEC_2019: u32 = 201900;
pub const SPEC_CURRENT: u32 = SPEC_2019;

/// Declared shape of one field within a message template.
#[derive(Debug, Clone)]
pub struct FieldTemplate {
    name: String,
    field_type: FieldType,
    required: bool,
}

impl FieldTemplate {
    pub fn new(name: &str, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

/// Template for one message type, keyed by its schema identifier
/// (for example `MSG.HB` or `REQ.DIR`).
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    id: String,
    fields: Vec<FieldTemplate>,
}

impl MessageTemplate {
    pub fn new(id: &str, fields: Vec<FieldTemplate>) -> Self {
        Self {
            id: id.to_string(),
            fields,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn field(&self, name: &str) -> Option<&FieldTemplate> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Reject the message if a required field is absent or a declared
    /// field carries a value that cannot satisfy its declared type.
    pub fn check(&self, msg: &Message) -> Result<()> {
        for decl in &self.fields {
            match msg.get_field(&decl.name) {
                None if decl.required => {
                    return Err(Status::new(
                        StatusClass::MistError,
                        StatusCode::InvalidMsg,
                        format!("Message is missing required field {}", decl.name),
                    ));
                }
                None => {}
                Some(field) => {
                    if field.field_type() != decl.field_type
                        && coerce(decl.field_type, field.value(), true).is_err()
                    {
                        return Err(Status::new(
                            StatusClass::MistError,
                            StatusCode::InvalidTypeConversion,
                            format!(
                                "Field {} must be {} (found {})",
                                decl.name,
                                decl.field_type.tag(),
                                field.field_type().tag()
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// The externally-selected message specification: a version, a schema
/// level, and the set of templates registered against it.
pub struct Specification {
    version: u32,
    schema_level: u8,
    legacy_schema_files: bool,
    templates: RwLock<HashMap<String, Arc<MessageTemplate>>>,
}

impl Specification {
    pub fn from_config(config: &Config) -> Result<Self> {
        let version = match config.value(keys::SPECIFICATION_VERSION) {
            Some(raw) => {
                let parsed = raw.trim().parse::<u32>().map_err(|_| {
                    Status::new(
                        StatusClass::ConfigError,
                        StatusCode::InvalidFieldValue,
                        format!("Invalid specification version: {raw}"),
                    )
                })?;
                match parsed {
                    SPEC_2014 | SPEC_2016 | SPEC_2018 | SPEC_2019 => parsed,
                    other => {
                        return Err(Status::new(
                            StatusClass::ConfigError,
                            StatusCode::InvalidFieldValue,
                            format!("Unsupported specification version: {other}"),
                        ))
                    }
                }
            }
            None => SPEC_CURRENT,
        };

        let schema_level = {
            let raw = config.integer_value(keys::SCHEMA_LEVEL, 0);
            if !(0..=10).contains(&raw) {
                return Err(Status::new(
                    StatusClass::ConfigError,
                    StatusCode::InvalidFieldValue,
                    format!("Invalid schema level: {raw}"),
                ));
            }
            raw as u8
        };

        Ok(Self {
            version,
            schema_level,
            legacy_schema_files: config.boolean_value(keys::LEGACY_SCHEMA_FILES, false),
            templates: RwLock::new(HashMap::new()),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn schema_level(&self) -> u8 {
        self.schema_level
    }

    pub fn uses_legacy_schema_files(&self) -> bool {
        self.legacy_schema_files
    }

    /// Register a template under its schema identifier.
    pub fn register_template(&self, template: MessageTemplate) {
        self.templates
            .write()
            .insert(template.id().to_string(), Arc::new(template));
    }

    /// Schema identifier for a message: `MESSAGE-TYPE[.SUBTYPE]`, with
    /// the subtype field name depending on the specification version.
    pub fn schema_id(&self, msg: &Message) -> Option<String> {
        let msg_type = msg.string_value("MESSAGE-TYPE")?;
        let subtype_field = if self.version < SPEC_2019 {
            "C2CX-SUBTYPE"
        } else {
            "MESSAGE-SUBTYPE"
        };
        match msg.string_value(subtype_field) {
            Some(subtype) => Some(format!("{msg_type}.{subtype}")),
            None => Some(msg_type),
        }
    }

    pub fn template_for(&self, msg: &Message) -> Option<Arc<MessageTemplate>> {
        let id = self.schema_id(msg)?;
        self.templates.read().get(&id).cloned()
    }

    /// Attach the matching template to the message so subsequent
    /// `set_field_value` calls coerce against declared types.
    pub fn apply(&self, msg: &mut Message) {
        if let Some(template) = self.template_for(msg) {
            msg.set_template(template);
        }
    }

    /// Consume-or-reject contract: a message with a known template must
    /// satisfy it; a message without one passes through.
    pub fn validate(&self, msg: &Message) -> Result<()> {
        match self.template_for(msg) {
            Some(template) => template.check(msg),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Specification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Specification")
            .field("version", &self.version)
            .field("schema_level", &self.schema_level)
            .field("templates", &self.templates.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;

    fn heartbeat_template() -> MessageTemplate {
        MessageTemplate::new(
            "MSG.HB",
            vec![
                FieldTemplate::new("MESSAGE-TYPE", FieldType::String, true),
                FieldTemplate::new("MESSAGE-SUBTYPE", FieldType::String, true),
                FieldTemplate::new("PUB-RATE", FieldType::U16, false),
            ],
        )
    }

    fn heartbeat() -> Message {
        let mut msg = Message::new("C2MS.SAT1.MSG.HB", Kind::Publish).unwrap();
        msg.add_field_value("MESSAGE-TYPE", "MSG").unwrap();
        msg.add_field_value("MESSAGE-SUBTYPE", "HB").unwrap();
        msg
    }

    #[test]
    fn default_specification() {
        let spec = Specification::from_config(&Config::new()).unwrap();
        assert_eq!(spec.version(), SPEC_CURRENT);
        assert_eq!(spec.schema_level(), 0);
    }

    #[test]
    fn rejects_unknown_versions() {
        let config = Config::from_args("gmsec-specification-version=199900").unwrap();
        assert!(Specification::from_config(&config).is_err());
        let config = Config::from_args("gmsec-specification-version=latest").unwrap();
        assert!(Specification::from_config(&config).is_err());
    }

    #[test]
    fn validation_rejects_missing_required_field() {
        let spec = Specification::from_config(&Config::new()).unwrap();
        spec.register_template(MessageTemplate::new(
            "MSG.HB",
            vec![
                FieldTemplate::new("MESSAGE-TYPE", FieldType::String, true),
                FieldTemplate::new("MESSAGE-SUBTYPE", FieldType::String, true),
                FieldTemplate::new("PUB-RATE", FieldType::U16, true),
            ],
        ));

        let mut msg = heartbeat();
        let err = spec.validate(&msg).unwrap_err();
        assert_eq!(err.class(), StatusClass::MistError);
        assert!(err.text().contains("PUB-RATE"));

        msg.add_field_value("PUB-RATE", 30u16).unwrap();
        assert!(spec.validate(&msg).is_ok());
    }

    #[test]
    fn messages_without_a_template_pass_through() {
        let spec = Specification::from_config(&Config::new()).unwrap();
        let msg = heartbeat();
        assert!(spec.validate(&msg).is_ok());
    }

    #[test]
    fn validation_rejects_untypable_values() {
        let spec = Specification::from_config(&Config::new()).unwrap();
        spec.register_template(heartbeat_template());

        let mut msg = heartbeat();
        msg.add_field_value("PUB-RATE", "often").unwrap();
        let err = spec.validate(&msg).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidTypeConversion);

        msg.add_field_value("PUB-RATE", "30").unwrap();
        assert!(spec.validate(&msg).is_ok());
    }

    #[test]
    fn subtype_field_depends_on_version() {
        let spec_2016 = Specification::from_config(
            &Config::from_args("gmsec-specification-version=201600").unwrap(),
        )
        .unwrap();
        let mut msg = heartbeat();
        msg.add_field_value("C2CX-SUBTYPE", "HB").unwrap();

        assert_eq!(spec_2016.schema_id(&msg).unwrap(), "MSG.HB");
        let spec_2019 = Specification::from_config(&Config::new()).unwrap();
        assert_eq!(spec_2019.schema_id(&msg).unwrap(), "MSG.HB");
    }

    #[test]
    fn apply_attaches_template_for_coercion() {
        let spec = Specification::from_config(&Config::new()).unwrap();
        spec.register_template(heartbeat_template());

        let mut msg = heartbeat();
        spec.apply(&mut msg);
        msg.set_field_value("PUB-RATE", "30").unwrap();
        assert_eq!(
            msg.get_field("PUB-RATE").unwrap().field_type(),
            FieldType::U16
        );
    }
}

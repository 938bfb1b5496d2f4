//! JSON representation of entities.
//!
//! Entities cross the [`PersistenceContext`](crate::PersistenceContext)
//! boundary as JSON objects keyed by attribute name:
//!
//! | Mapping | JSON |
//! |---------|------|
//! | direct | the value |
//! | embedded | a nested object, or `null` |
//! | reference | the target's key, or `null` |
//! | collection | an array of target keys, present only once fetched |
//!
//! Reading accepts the same shapes. A reference may also be given as an
//! object carrying the target's primary-key attribute.

use persist_core::{
    AttributeValue, ClassDescriptor, Entity, Error, Mapping, Project, Result, Value,
};
use serde_json::{Map, Value as Json};

/// Render `entity` as a JSON object.
pub fn entity_to_json(project: &Project, entity: &Entity) -> Json {
    let mut out = Map::new();
    for (attribute, value) in entity.attributes() {
        let rendered = match value {
            AttributeValue::Basic(v) => v.to_json(),
            AttributeValue::Reference(holder) => {
                holder.key().map_or(Json::Null, Value::to_json)
            }
            AttributeValue::Collection(holder) => match holder.items() {
                Some(items) => Json::Array(
                    items
                        .iter()
                        .map(|item| key_json(project, &persist_core::sync::read(item)))
                        .collect(),
                ),
                None => continue,
            },
            AttributeValue::Embedded(inner) => inner
                .as_deref()
                .map_or(Json::Null, |inner| entity_to_json(project, inner)),
        };
        out.insert(attribute.to_string(), rendered);
    }
    Json::Object(out)
}

/// The key of `entity` as JSON: a scalar for single keys, an array for
/// composite ones, `null` while unassigned.
pub fn key_json(project: &Project, entity: &Entity) -> Json {
    let Some(desc) = project.descriptor(entity.entity_name()) else {
        return Json::Null;
    };
    match entity.primary_key(desc) {
        Some(pk) if pk.values().len() == 1 => pk.values()[0].to_json(),
        Some(pk) => Json::Array(pk.values().iter().map(Value::to_json).collect()),
        None => Json::Null,
    }
}

/// Build an entity of type `entity` from a JSON object.
///
/// Attributes missing from `json` stay unset. Unknown attributes and values
/// of the wrong type are rejected.
pub fn entity_from_json(project: &Project, entity: &str, json: &Json) -> Result<Entity> {
    let desc = project.require(entity)?;
    let Json::Object(fields) = json else {
        return Err(Error::illegal_argument(format!(
            "expected a JSON object for '{entity}', got {json}"
        )));
    };
    let mut out = Entity::new(desc.entity_name());
    for (attribute, value) in fields {
        let mapping = desc.mapping(attribute).ok_or_else(|| {
            Error::illegal_argument(format!("'{entity}' has no attribute '{attribute}'"))
        })?;
        let decoded = attribute_from_json(project, mapping, value)?;
        out.set_attribute(attribute.clone(), decoded);
    }
    Ok(out)
}

/// Decode the JSON value of one attribute.
pub fn attribute_from_json(
    project: &Project,
    mapping: &Mapping,
    json: &Json,
) -> Result<AttributeValue> {
    match mapping {
        Mapping::Direct { attribute_type, .. } => {
            Ok(AttributeValue::Basic(attribute_type.from_json(json)?.normalized()))
        }
        Mapping::Reference { target, .. } => {
            let key = reference_key(project, target, json)?;
            Ok(AttributeValue::Reference(persist_core::ValueHolder::from_key(key)))
        }
        Mapping::Embedded { embeddable, .. } => {
            if json.is_null() {
                return Ok(AttributeValue::Embedded(None));
            }
            let inner = entity_from_json(project, embeddable, json)?;
            Ok(AttributeValue::Embedded(Some(Box::new(inner))))
        }
        Mapping::Collection { attribute, .. } => Err(Error::illegal_argument(format!(
            "collection '{attribute}' is written through its owning reference"
        ))),
    }
}

/// The foreign-key value for a reference to `target` given as JSON.
fn reference_key(project: &Project, target: &str, json: &Json) -> Result<Value> {
    let desc = project.require(target)?;
    let pk = single_key_attribute(desc)?;
    let key_type = desc
        .attribute_type(pk)
        .ok_or_else(|| Error::illegal_state(format!("'{target}' key '{pk}' has no type")))?;
    let raw = match json {
        Json::Object(fields) => fields.get(pk).unwrap_or(&Json::Null),
        other => other,
    };
    Ok(key_type.from_json(raw)?.normalized())
}

fn single_key_attribute(desc: &ClassDescriptor) -> Result<&str> {
    match desc.primary_key() {
        [single] => Ok(single),
        _ => Err(Error::illegal_argument(format!(
            "'{}' must have a single-attribute key to be referenced",
            desc.entity_name()
        ))),
    }
}

/// Primary-key values of `entity` from JSON: a scalar, an array in key
/// order, or an object keyed by key attribute.
pub fn key_from_json(desc: &ClassDescriptor, json: &Json) -> Result<Vec<Value>> {
    let attrs = desc.primary_key();
    let raw: Vec<&Json> = match json {
        Json::Array(items) => items.iter().collect(),
        Json::Object(fields) => attrs
            .iter()
            .map(|a| fields.get(a).unwrap_or(&Json::Null))
            .collect(),
        scalar => vec![scalar],
    };
    if raw.len() != attrs.len() {
        return Err(Error::illegal_argument(format!(
            "'{}' has a {}-part key, got {}",
            desc.entity_name(),
            attrs.len(),
            json
        )));
    }
    attrs
        .iter()
        .zip(raw)
        .map(|(attr, value)| {
            if value.is_null() {
                return Err(Error::illegal_argument(format!(
                    "key attribute '{attr}' of '{}' is null",
                    desc.entity_name()
                )));
            }
            let ty = desc.attribute_type(attr).ok_or_else(|| {
                Error::illegal_state(format!("key attribute '{attr}' has no type"))
            })?;
            Ok(ty.from_json(value)?.normalized())
        })
        .collect()
}

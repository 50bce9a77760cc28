//! Rich-text operations and the transform/compose rules of the document service.
//!
//! An [`Operation`] walks a document from the start: retain `n` characters,
//! insert text, or delete `n` characters. Lengths count Unicode scalar values.
//! Retains and inserts may carry a JSON attribute object; a `null` attribute
//! value removes that attribute when composed onto existing text.
//!
//! Wire form of a component, one key per kind:
//!
//! ```text
//! {"insert": "abc", "attributes": {"bold": true}}
//! {"insert": {"image": "..."}}        embedded object, one U+FFFC character
//! {"retain": 3, "attributes": {...}}
//! {"delete": 2}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Attributes = serde_json::Map<String, Value>;

/// Placeholder text for an inserted embed.
const OBJECT_REPLACEMENT: &str = "\u{fffc}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireComponent", into = "WireComponent")]
pub enum Component {
    Retain { len: u32, attributes: Option<Attributes> },
    Insert { text: String, attributes: Option<Attributes> },
    Delete(u32),
}

impl Component {
    pub fn len(&self) -> u32 {
        match self {
            Component::Retain { len, .. } => *len,
            Component::Insert { text, .. } => char_len(text),
            Component::Delete(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize, Deserialize)]
struct WireComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    insert: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retain: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delete: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attributes: Option<Attributes>,
}

impl TryFrom<WireComponent> for Component {
    type Error = &'static str;

    fn try_from(wire: WireComponent) -> Result<Self, Self::Error> {
        let attributes = wire.attributes.filter(|a| !a.is_empty());
        match (wire.insert, wire.retain, wire.delete) {
            (Some(Value::String(text)), _, _) => Ok(Component::Insert { text, attributes }),
            (Some(Value::Object(_)), _, _) => {
                Ok(Component::Insert { text: OBJECT_REPLACEMENT.to_string(), attributes })
            }
            (Some(_), _, _) => Err("insert must be a string or an object"),
            (None, Some(len), _) => Ok(Component::Retain { len, attributes }),
            (None, None, Some(len)) => Ok(Component::Delete(len)),
            (None, None, None) => Err("component needs one of insert, retain or delete"),
        }
    }
}

impl From<Component> for WireComponent {
    fn from(c: Component) -> Self {
        let mut wire = WireComponent { insert: None, retain: None, delete: None, attributes: None };
        match c {
            Component::Retain { len, attributes } => {
                wire.retain = Some(len);
                wire.attributes = attributes;
            }
            Component::Insert { text, attributes } => {
                wire.insert = Some(Value::String(text));
                wire.attributes = attributes;
            }
            Component::Delete(len) => wire.delete = Some(len),
        }
        wire
    }
}

/// A sequence of components. Adjacent components of the same kind and
/// attributes are merged as they are pushed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub ops: Vec<Component>,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, len: u32, attributes: Option<Attributes>) -> &mut Self {
        if len == 0 {
            return self;
        }
        let attributes = attributes.filter(|a| !a.is_empty());
        if let Some(Component::Retain { len: last, attributes: last_attrs }) = self.ops.last_mut() {
            if *last_attrs == attributes {
                *last = last.saturating_add(len);
                return self;
            }
        }
        self.ops.push(Component::Retain { len, attributes });
        self
    }

    pub fn insert(&mut self, text: impl Into<String>, attributes: Option<Attributes>) -> &mut Self {
        let text = text.into();
        if text.is_empty() {
            return self;
        }
        let attributes = attributes.filter(|a| !a.is_empty());
        if let Some(Component::Insert { text: last, attributes: last_attrs }) = self.ops.last_mut() {
            if *last_attrs == attributes {
                last.push_str(&text);
                return self;
            }
        }
        self.ops.push(Component::Insert { text, attributes });
        self
    }

    pub fn delete(&mut self, len: u32) -> &mut Self {
        if len == 0 {
            return self;
        }
        if let Some(Component::Delete(last)) = self.ops.last_mut() {
            *last = last.saturating_add(len);
            return self;
        }
        self.ops.push(Component::Delete(len));
        self
    }

    /// The same edit rebuilt through the merging builders, without empty components.
    pub fn normalized(self) -> Operation {
        let mut out = Operation::new();
        for c in self.ops {
            match c {
                Component::Retain { len, attributes } => out.retain(len, attributes),
                Component::Insert { text, attributes } => out.insert(text, attributes),
                Component::Delete(len) => out.delete(len),
            };
        }
        out
    }

    /// Length of the document this operation applies to (retains and deletes).
    pub fn base_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|c| match c {
                Component::Insert { .. } => 0,
                other => u64::from(other.len()),
            })
            .sum()
    }

    /// Length of the document after applying (retains and inserts).
    pub fn target_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|c| match c {
                Component::Delete(_) => 0,
                other => u64::from(other.len()),
            })
            .sum()
    }

    /// Concatenated inserted text; the plain text of a document snapshot.
    pub fn text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|c| match c {
                Component::Insert { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn char_len(text: &str) -> u32 {
    text.chars().count() as u32
}

/// Walks an operation in arbitrary-sized steps.
struct Cursor<'a> {
    ops: &'a [Component],
    index: usize,
    offset: u32,
}

impl<'a> Cursor<'a> {
    fn new(op: &'a Operation) -> Self {
        Self { ops: &op.ops, index: 0, offset: 0 }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    /// The unconsumed rest of the current component. Past the end this is
    /// an unbounded retain.
    fn peek(&self) -> Component {
        let Some(c) = self.ops.get(self.index) else {
            return Component::Retain { len: u32::MAX, attributes: None };
        };
        match c {
            Component::Retain { len, attributes } => {
                Component::Retain { len: len - self.offset, attributes: attributes.clone() }
            }
            Component::Insert { text, attributes } => Component::Insert {
                text: text.chars().skip(self.offset as usize).collect(),
                attributes: attributes.clone(),
            },
            Component::Delete(len) => Component::Delete(len - self.offset),
        }
    }

    fn advance(&mut self, n: u32) {
        let Some(c) = self.ops.get(self.index) else {
            return;
        };
        self.offset = self.offset.saturating_add(n);
        if self.offset >= c.len() {
            self.index += 1;
            self.offset = 0;
        }
    }
}

/// Rewrite `client` so it applies after `server`, both made against the same
/// revision. On concurrent inserts at one position the server's text comes
/// first.
pub fn transform(client: &Operation, server: &Operation) -> Operation {
    let mut out = Operation::new();
    let mut a = Cursor::new(client);
    let mut b = Cursor::new(server);
    while a.has_next() || b.has_next() {
        match (a.peek(), b.peek()) {
            (_, Component::Insert { text, .. }) => {
                let n = char_len(&text);
                out.retain(n, None);
                b.advance(n);
            }
            (Component::Insert { text, attributes }, _) => {
                let n = char_len(&text);
                out.insert(text, attributes);
                a.advance(n);
            }
            (ca, cb) => {
                let n = ca.len().min(cb.len());
                match (ca, cb) {
                    (Component::Retain { attributes, .. }, Component::Retain { .. }) => {
                        out.retain(n, attributes);
                    }
                    (Component::Delete(_), Component::Retain { .. }) => {
                        out.delete(n);
                    }
                    // the server already deleted these characters
                    _ => {}
                }
                a.advance(n);
                b.advance(n);
            }
        }
    }
    out
}

/// The single operation equivalent to applying `base` then `next`.
pub fn compose(base: &Operation, next: &Operation) -> Operation {
    let mut out = Operation::new();
    let mut a = Cursor::new(base);
    let mut b = Cursor::new(next);
    while a.has_next() || b.has_next() {
        match (a.peek(), b.peek()) {
            (_, Component::Insert { text, attributes }) => {
                let n = char_len(&text);
                out.insert(text, attributes);
                b.advance(n);
            }
            (Component::Delete(n), _) => {
                out.delete(n);
                a.advance(n);
            }
            (ca, cb) => {
                let n = ca.len().min(cb.len());
                match (ca, cb) {
                    (Component::Insert { text, attributes: old }, Component::Retain { attributes: new, .. }) => {
                        let head: String = text.chars().take(n as usize).collect();
                        out.insert(head, compose_attributes(new, old));
                    }
                    (Component::Retain { attributes: old, .. }, Component::Retain { attributes: new, .. }) => {
                        out.retain(n, compose_attributes(new, old));
                    }
                    (Component::Retain { .. }, Component::Delete(_)) => {
                        out.delete(n);
                    }
                    // inserted then deleted
                    _ => {}
                }
                a.advance(n);
                b.advance(n);
            }
        }
    }
    out
}

/// Overlay `new` on `old`; `null` values in `new` remove keys.
pub fn compose_attributes(new: Option<Attributes>, old: Option<Attributes>) -> Option<Attributes> {
    match (new, old) {
        (None, old) => old,
        (new, None) => new,
        (Some(new), Some(mut merged)) => {
            for (key, value) in new {
                if value.is_null() {
                    merged.remove(&key);
                } else {
                    merged.insert(key, value);
                }
            }
            Some(merged)
        }
    }
}

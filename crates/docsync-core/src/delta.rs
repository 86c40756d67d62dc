//! Rich-text deltas: ordered `retain` / `insert` / `delete` operations.
//!
//! A delta either describes a change (any mix of operations) or a whole
//! document (inserts only). Composing a document with a change yields the
//! next document, so the visible content of a session is always
//! `loaded.compose(d1).compose(d2)...` in arrival order.
//!
//! Lengths count Unicode scalar values. An embed (e.g. an image) counts as
//! one. Wire format follows the usual rich-text delta JSON:
//!
//! ```json
//! {"ops":[{"retain":5},{"insert":"!","attributes":{"bold":true}},{"delete":2}]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Formatting attached to inserted or retained content. A `null` value on a
/// retain removes that attribute.
pub type Attributes = Map<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Change spans {base} characters but the document only has {len}")]
    OutOfBounds { base: usize, len: usize },

    #[error("Target is not a document (contains retain or delete operations)")]
    NotADocument,
}

/// Content carried by an insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Insert {
    Text(String),
    /// Non-text content such as `{"image": "https://..."}`.
    Embed(Map<String, Value>),
}

impl Insert {
    pub fn len(&self) -> usize {
        match self {
            Insert::Text(text) => text.chars().count(),
            Insert::Embed(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Insert,
    Retain,
    Delete,
}

/// A single delta operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Op {
    Insert {
        insert: Insert,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Retain {
        retain: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Delete {
        delete: usize,
    },
}

impl Op {
    /// Number of characters this operation covers.
    pub fn len(&self) -> usize {
        match self {
            Op::Insert { insert, .. } => insert.len(),
            Op::Retain { retain, .. } => *retain,
            Op::Delete { delete } => *delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Op::Insert { attributes, .. } | Op::Retain { attributes, .. } => attributes.as_ref(),
            Op::Delete { .. } => None,
        }
    }

    fn kind(&self) -> OpKind {
        match self {
            Op::Insert { .. } => OpKind::Insert,
            Op::Retain { .. } => OpKind::Retain,
            Op::Delete { .. } => OpKind::Delete,
        }
    }

    /// Drop empty attribute maps so `{}` and absent compare equal.
    fn normalized(self) -> Self {
        match self {
            Op::Insert { insert, attributes } => Op::Insert {
                insert,
                attributes: attributes.filter(|a| !a.is_empty()),
            },
            Op::Retain { retain, attributes } => Op::Retain {
                retain,
                attributes: attributes.filter(|a| !a.is_empty()),
            },
            op => op,
        }
    }
}

/// An ordered, normalized sequence of operations.
///
/// Normalized means: no zero-length ops, adjacent ops of the same kind and
/// attributes are merged, and an insert never directly follows a delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "DeltaRepr")]
pub struct Delta {
    ops: Vec<Op>,
}

#[derive(Deserialize)]
struct DeltaRepr {
    ops: Vec<Op>,
}

impl From<DeltaRepr> for Delta {
    fn from(repr: DeltaRepr) -> Self {
        Delta::from_ops(repr.ops)
    }
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a delta from raw operations, normalizing as it goes.
    pub fn from_ops(ops: impl IntoIterator<Item = Op>) -> Self {
        let mut delta = Self::new();
        for op in ops {
            delta.push(op);
        }
        delta
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn insert(self, text: impl Into<String>) -> Self {
        self.insert_with(text, Attributes::new())
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        self.push(Op::Insert {
            insert: Insert::Text(text.into()),
            attributes: Some(attributes),
        });
        self
    }

    pub fn insert_embed(mut self, embed: Map<String, Value>) -> Self {
        self.push(Op::Insert {
            insert: Insert::Embed(embed),
            attributes: None,
        });
        self
    }

    pub fn retain(self, len: usize) -> Self {
        self.retain_with(len, Attributes::new())
    }

    pub fn retain_with(mut self, len: usize, attributes: Attributes) -> Self {
        self.push(Op::Retain {
            retain: len,
            attributes: Some(attributes),
        });
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(Op::Delete { delete: len });
        self
    }

    /// Append an operation, merging it into its neighbour where possible.
    pub fn push(&mut self, op: Op) -> &mut Self {
        let op = op.normalized();
        if op.is_empty() {
            return self;
        }

        let mut index = self.ops.len();
        if index > 0 {
            if let (Op::Delete { delete: last }, Op::Delete { delete }) =
                (&mut self.ops[index - 1], &op)
            {
                *last += *delete;
                return self;
            }

            // Inserts are ordered before an adjacent delete.
            if self.ops[index - 1].kind() == OpKind::Delete && op.kind() == OpKind::Insert {
                index -= 1;
                if index == 0 {
                    self.ops.insert(0, op);
                    return self;
                }
            }

            if let Some(merged) = merge(&self.ops[index - 1], &op) {
                self.ops[index - 1] = merged;
                return self;
            }
        }

        self.ops.insert(index, op);
        self
    }

    /// Remove a trailing plain retain, which carries no information.
    pub fn chop(mut self) -> Self {
        if let Some(Op::Retain {
            attributes: None, ..
        }) = self.ops.last()
        {
            self.ops.pop();
        }
        self
    }

    /// Total length covered by all operations.
    pub fn length(&self) -> usize {
        self.ops
            .iter()
            .fold(0usize, |acc, op| acc.saturating_add(op.len()))
    }

    /// Length of the document this change expects to be applied to.
    pub fn base_length(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| op.kind() != OpKind::Insert)
            .fold(0usize, |acc, op| acc.saturating_add(op.len()))
    }

    /// True if this delta only inserts, i.e. describes a whole document.
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(|op| op.kind() == OpKind::Insert)
    }

    /// Text content of a document, skipping embeds.
    pub fn plain_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Insert {
                    insert: Insert::Text(text),
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Compose two deltas: the result has the same effect as applying `self`
    /// and then `other`.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this = OpIter::new(&self.ops);
        let mut that = OpIter::new(&other.ops);
        let mut delta = Delta::new();

        while this.has_next() || that.has_next() {
            if that.peek_kind() == OpKind::Insert {
                delta.push(that.next_op());
            } else if this.peek_kind() == OpKind::Delete {
                delta.push(this.next_op());
            } else {
                let length = this.peek_length().min(that.peek_length());
                let this_op = this.next(length);
                let that_op = that.next(length);

                match (this_op, that_op) {
                    (
                        Op::Retain { attributes, .. },
                        Op::Retain {
                            attributes: changes,
                            ..
                        },
                    ) => {
                        delta.push(Op::Retain {
                            retain: length,
                            attributes: compose_attributes(
                                attributes.as_ref(),
                                changes.as_ref(),
                                true,
                            ),
                        });
                    }
                    (
                        Op::Insert { insert, attributes },
                        Op::Retain {
                            attributes: changes,
                            ..
                        },
                    ) => {
                        delta.push(Op::Insert {
                            insert,
                            attributes: compose_attributes(
                                attributes.as_ref(),
                                changes.as_ref(),
                                false,
                            ),
                        });
                    }
                    (Op::Retain { .. }, delete @ Op::Delete { .. }) => {
                        delta.push(delete);
                    }
                    // An insert followed by a delete of the same span cancels out.
                    _ => {}
                }
            }
        }

        delta.chop()
    }

    /// Apply a change to this document, returning the new document.
    pub fn apply(&self, change: &Delta) -> Result<Delta, DeltaError> {
        if !self.is_document() {
            return Err(DeltaError::NotADocument);
        }
        let base = change.base_length();
        let len = self.length();
        if base > len {
            return Err(DeltaError::OutOfBounds { base, len });
        }
        Ok(self.compose(change))
    }
}

impl From<Vec<Op>> for Delta {
    fn from(ops: Vec<Op>) -> Self {
        Delta::from_ops(ops)
    }
}

fn merge(prev: &Op, next: &Op) -> Option<Op> {
    match (prev, next) {
        (
            Op::Insert {
                insert: Insert::Text(a),
                attributes: prev_attrs,
            },
            Op::Insert {
                insert: Insert::Text(b),
                attributes: next_attrs,
            },
        ) if prev_attrs == next_attrs => Some(Op::Insert {
            insert: Insert::Text(format!("{a}{b}")),
            attributes: next_attrs.clone(),
        }),
        (
            Op::Retain {
                retain: a,
                attributes: prev_attrs,
            },
            Op::Retain {
                retain: b,
                attributes: next_attrs,
            },
        ) if prev_attrs == next_attrs => Some(Op::Retain {
            retain: a.saturating_add(*b),
            attributes: next_attrs.clone(),
        }),
        _ => None,
    }
}

/// Layer `changes` over `base`. With `keep_null`, `null` values survive so a
/// composed retain can still remove the attribute later.
fn compose_attributes(
    base: Option<&Attributes>,
    changes: Option<&Attributes>,
    keep_null: bool,
) -> Option<Attributes> {
    let mut attributes = changes.cloned().unwrap_or_default();
    if !keep_null {
        attributes.retain(|_, value| !value.is_null());
    }
    if let Some(base) = base {
        for (key, value) in base {
            if !changes.is_some_and(|c| c.contains_key(key)) {
                attributes.insert(key.clone(), value.clone());
            }
        }
    }
    (!attributes.is_empty()).then_some(attributes)
}

/// Cursor over a slice of ops that can split an op into pieces.
struct OpIter<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    /// Remaining length of the current op; unbounded once exhausted.
    fn peek_length(&self) -> usize {
        self.ops
            .get(self.index)
            .map(|op| op.len() - self.offset)
            .unwrap_or(usize::MAX)
    }

    /// An exhausted iterator behaves like an endless retain.
    fn peek_kind(&self) -> OpKind {
        self.ops
            .get(self.index)
            .map(Op::kind)
            .unwrap_or(OpKind::Retain)
    }

    fn next_op(&mut self) -> Op {
        self.next(usize::MAX)
    }

    /// Take up to `length` characters from the current op.
    fn next(&mut self, length: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::Retain {
                retain: usize::MAX,
                attributes: None,
            };
        };

        let offset = self.offset;
        let remaining = op.len() - offset;
        let length = if length >= remaining {
            self.index += 1;
            self.offset = 0;
            remaining
        } else {
            self.offset += length;
            length
        };

        match op {
            Op::Delete { .. } => Op::Delete { delete: length },
            Op::Retain { attributes, .. } => Op::Retain {
                retain: length,
                attributes: attributes.clone(),
            },
            Op::Insert {
                insert: Insert::Text(text),
                attributes,
            } => Op::Insert {
                insert: Insert::Text(text.chars().skip(offset).take(length).collect()),
                attributes: attributes.clone(),
            },
            Op::Insert {
                insert: Insert::Embed(embed),
                attributes,
            } => Op::Insert {
                insert: Insert::Embed(embed.clone()),
                attributes: attributes.clone(),
            },
        }
    }
}
